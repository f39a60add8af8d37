//! Module that prints leveled, colored log lines to the terminal.

use color_print::cformat;
use std::sync::atomic::{AtomicBool, Ordering};

static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Function that enables or disables `debug` output.
pub fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
}

/// Function that tells if `debug` output is enabled.
pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

pub fn info(msg: &str) {
    println!("{}", cformat!("<green, bold>[INFO]</green, bold>  {}", msg));
}

pub fn warn(msg: &str) {
    println!("{}", cformat!("<yellow, bold>[WARN]</yellow, bold>  {}", msg));
}

pub fn error(msg: &str) {
    eprintln!("{}", cformat!("<red, bold>[ERROR]</red, bold> {}", msg));
}

pub fn debug(msg: &str) {
    if is_verbose() {
        println!("{}", cformat!("<blue, bold>[DEBUG]</blue, bold> {}", msg));
    }
}
