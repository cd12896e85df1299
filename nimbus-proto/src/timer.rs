use std::ops::{Index, IndexMut};

/// Kinds of timeouts needed to run the protocol logic
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Timer {
    /// When to give up on an in-progress handshake
    Handshake = 0,
    /// When to send a keepalive ping after inbound silence
    Ping = 1,
    /// When to abort a stalled OTA transfer
    OtaInactivity = 2,
    /// When to retry connecting after a session failure
    Reconnect = 3,
    /// When to persist the resumable session blob next
    BlobSave = 4,
}

impl Timer {
    pub(crate) const VALUES: [Self; 5] = [
        Self::Handshake,
        Self::Ping,
        Self::OtaInactivity,
        Self::Reconnect,
        Self::BlobSave,
    ];
}

/// Deadlines (in platform milliseconds) for each distinct kind of `Timer`
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct TimerTable {
    data: [Option<u64>; 5],
}

impl TimerTable {
    pub fn set(&mut self, timer: Timer, deadline: u64) {
        self[timer] = Some(deadline);
    }

    pub fn stop(&mut self, timer: Timer) {
        self[timer] = None;
    }

    /// Take every timer whose deadline has passed
    pub fn expired(&mut self, now: u64) -> impl Iterator<Item = Timer> + '_ {
        Timer::VALUES.into_iter().filter(move |&timer| {
            if self[timer].is_some_and(|deadline| deadline <= now) {
                self[timer] = None;
                true
            } else {
                false
            }
        })
    }

    pub fn reset(&mut self) {
        self.data = [None; 5];
    }
}

impl Index<Timer> for TimerTable {
    type Output = Option<u64>;
    fn index(&self, index: Timer) -> &Option<u64> {
        &self.data[index as usize]
    }
}

impl IndexMut<Timer> for TimerTable {
    fn index_mut(&mut self, index: Timer) -> &mut Option<u64> {
        &mut self.data[index as usize]
    }
}
