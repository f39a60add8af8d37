//! Module that holds the coordination state of one peer: logical clock,
//! request table, token record and token state.
//!
//! Nothing here talks to the network. `DistributedLock` keeps a `LockState`
//! behind its mutex and turns the decisions taken here into remote calls.

use crate::message::{format_table, PeerId, Timestamp, TokenRecord};
use color_print::cformat;
use std::{collections::BTreeMap, fmt};

/// Highest known request time per peer.
pub type RequestTable = BTreeMap<PeerId, Timestamp>;

/// Enum that tells if a peer holds the token and whether it is using it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    NoToken,
    /// Token present but not in use.
    TokenIdle,
    /// Token present and the critical section is being executed.
    TokenHeld,
}

impl TokenState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NoToken => "no token",
            Self::TokenIdle => "token idle",
            Self::TokenHeld => "token held",
        }
    }
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct LockState {
    pub owner: PeerId,
    pub clock: Timestamp,
    pub requests: RequestTable,
    /// Present iff `state` is not `NoToken`.
    pub token: Option<TokenRecord>,
    pub state: TokenState,
}

impl LockState {
    pub fn new(owner: PeerId) -> Self {
        Self {
            owner,
            clock: 0,
            requests: RequestTable::from([(owner, 0)]),
            token: None,
            state: TokenState::NoToken,
        }
    }

    pub fn owns_token(&self) -> bool {
        self.state != TokenState::NoToken
    }

    /// Function that merges an observed timestamp into the clock.
    pub fn merge(&mut self, time: Timestamp) {
        self.clock = self.clock.max(time);
    }

    /// Function that advances the clock for a local event and returns the new time.
    pub fn tick(&mut self) -> Timestamp {
        self.clock += 1;
        self.clock
    }

    /// Function that records that `pid` wants the token at `time`. Never moves backwards.
    pub fn record_request(&mut self, pid: PeerId, time: Timestamp) {
        let entry = self.requests.entry(pid).or_insert(0);
        *entry = (*entry).max(time);
    }

    /// Function that makes this peer the token owner with every known peer at zero usage.
    pub fn create_token(&mut self) {
        let token = self.requests.keys().map(|pid| (*pid, 0)).collect();
        self.token = Some(token);
        self.state = TokenState::TokenIdle;
    }

    pub fn add_peer(&mut self, pid: PeerId) {
        self.requests.entry(pid).or_insert(0);
        if let Some(token) = self.token.as_mut() {
            token.entry(pid).or_insert(0);
        }
    }

    /// Function that forgets a departed peer. The local peer is never removed.
    pub fn remove_peer(&mut self, pid: PeerId) {
        if pid == self.owner {
            return;
        }
        self.requests.remove(&pid);
        if let Some(token) = self.token.as_mut() {
            token.remove(&pid);
        }
    }

    /// Peers with a request newer than their last recorded use of the token.
    pub fn candidates(&self) -> Vec<PeerId> {
        let Some(token) = self.token.as_ref() else {
            return Vec::new();
        };

        self.requests
            .iter()
            .filter(|(pid, time)| {
                **pid != self.owner && **time > token.get(*pid).copied().unwrap_or(0)
            })
            .map(|(pid, _)| *pid)
            .collect()
    }

    /// The candidate the token should go to next, if any.
    pub fn successor(&self) -> Option<PeerId> {
        round_robin_successor(self.owner, &self.candidates())
    }

    /// Function that stamps the local use of the token and gives it up.
    /// Returns the record to send to the successor.
    pub fn surrender_token(&mut self) -> Option<TokenRecord> {
        let mut token = self.token.take()?;
        token.insert(self.owner, self.clock);
        self.state = TokenState::NoToken;
        Some(token)
    }

    /// Function that takes a token back after a handoff that didn't go through.
    pub fn restore_token(&mut self, token: TokenRecord) {
        self.token = Some(token);
        self.state = TokenState::TokenIdle;
    }

    /// Function that installs a token received from another peer.
    ///
    /// Entries are aligned with the local membership view: missing peers start
    /// at zero, peers no longer known are dropped. Fails without touching the
    /// state if this peer already owns a token.
    pub fn install_token(&mut self, mut token: TokenRecord) -> Result<(), String> {
        if self.state != TokenState::NoToken || self.token.is_some() {
            return Err(format!(
                "received a token while in state '{}' with record {}",
                self.state,
                self.token
                    .as_ref()
                    .map(format_table)
                    .unwrap_or_else(|| "absent".to_string())
            ));
        }

        if let Some(latest) = token.values().max() {
            self.merge(*latest);
        }
        token.retain(|pid, _| self.requests.contains_key(pid));
        for pid in self.requests.keys() {
            token.entry(*pid).or_insert(0);
        }

        self.token = Some(token);
        self.state = TokenState::TokenIdle;
        Ok(())
    }

    /// `true` when the invariants local to one peer hold.
    pub fn is_consistent(&self) -> bool {
        self.token.is_some() == self.owns_token() && self.requests.contains_key(&self.owner)
    }
}

/// Function that picks the first candidate scanning ids above `owner` in
/// increasing order, then wrapping around to the ids below it.
pub fn round_robin_successor(owner: PeerId, candidates: &[PeerId]) -> Option<PeerId> {
    let above = candidates.iter().filter(|pid| **pid > owner).min();
    let below = candidates.iter().filter(|pid| **pid < owner).min();
    above.or(below).copied()
}

/// Read-only snapshot of one peer's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStatus {
    pub owner: PeerId,
    pub state: TokenState,
    pub clock: Timestamp,
    pub requests: RequestTable,
    pub token: Option<TokenRecord>,
    pub peers: Vec<PeerId>,
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = self
            .token
            .as_ref()
            .map(format_table)
            .unwrap_or_else(|| "absent".to_string());
        let peers = self
            .peers
            .iter()
            .map(|pid| pid.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        writeln!(f, "{}", cformat!("Peer    :: <bold>{}</bold>", self.owner))?;
        writeln!(f, "{}", cformat!("State   :: <yellow, bold>{}</yellow, bold>", self.state))?;
        writeln!(f, "Request :: {}", format_table(&self.requests))?;
        writeln!(f, "Token   :: {token}")?;
        writeln!(f, "Time    :: {}", self.clock)?;
        write!(f, "Peers   :: [{peers}]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner_of_token(owner: PeerId, peers: &[PeerId]) -> LockState {
        let mut state = LockState::new(owner);
        for pid in peers {
            state.add_peer(*pid);
        }
        state.create_token();
        state
    }

    #[test]
    fn successor_scans_above_then_wraps() {
        assert_eq!(round_robin_successor(3, &[1, 5]), Some(5));
        assert_eq!(round_robin_successor(3, &[1, 2]), Some(1));
        assert_eq!(round_robin_successor(3, &[7, 4, 1]), Some(4));
        assert_eq!(round_robin_successor(9, &[2, 8]), Some(2));
        assert_eq!(round_robin_successor(3, &[]), None);
    }

    #[test]
    fn only_newer_requests_are_candidates() {
        let mut state = owner_of_token(3, &[1, 5]);
        state.record_request(5, 10);
        assert_eq!(state.candidates(), vec![5]);

        state.token.as_mut().unwrap().insert(5, 10);
        assert!(state.candidates().is_empty());
    }

    #[test]
    fn own_request_is_never_a_candidate() {
        let mut state = owner_of_token(3, &[1]);
        state.record_request(3, 40);
        assert!(state.candidates().is_empty());
    }

    #[test]
    fn requests_never_move_backwards() {
        let mut state = LockState::new(1);
        state.record_request(2, 8);
        state.record_request(2, 3);
        assert_eq!(state.requests[&2], 8);
    }

    #[test]
    fn merge_keeps_the_maximum() {
        let mut state = LockState::new(1);
        state.merge(6);
        state.merge(2);
        assert_eq!(state.clock, 6);
        assert_eq!(state.tick(), 7);
    }

    #[test]
    fn surrender_stamps_own_use() {
        let mut state = owner_of_token(3, &[1, 5]);
        state.clock = 12;

        let token = state.surrender_token().unwrap();

        assert_eq!(token[&3], 12);
        assert_eq!(state.state, TokenState::NoToken);
        assert!(state.token.is_none());
        assert!(state.is_consistent());
    }

    #[test]
    fn install_aligns_with_membership() {
        let mut state = LockState::new(2);
        state.add_peer(1);
        state.add_peer(4);

        state
            .install_token(TokenRecord::from([(1, 3), (2, 0), (9, 5)]))
            .unwrap();

        assert_eq!(
            state.token,
            Some(TokenRecord::from([(1, 3), (2, 0), (4, 0)]))
        );
        assert_eq!(state.clock, 5);
        assert_eq!(state.state, TokenState::TokenIdle);
    }

    #[test]
    fn second_token_is_refused() {
        let mut state = owner_of_token(1, &[2]);
        state.state = TokenState::TokenHeld;
        let before = state.token.clone();

        assert!(state.install_token(TokenRecord::from([(1, 9), (2, 9)])).is_err());
        assert_eq!(state.token, before);
        assert_eq!(state.state, TokenState::TokenHeld);
    }

    #[test]
    fn removing_a_peer_clears_both_tables() {
        let mut state = owner_of_token(3, &[1, 5]);
        state.record_request(5, 10);

        state.remove_peer(5);
        state.remove_peer(3);

        assert!(!state.requests.contains_key(&5));
        assert!(!state.token.as_ref().unwrap().contains_key(&5));
        assert!(state.requests.contains_key(&3));
    }
}
