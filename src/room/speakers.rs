#![forbid(unsafe_code)]

// Speaker ordering - most-recently-dominant-first audio producer ids

/// Maximum number of remote audio/video producer pairs a client consumes at once
pub const FAN_OUT_LIMIT: usize = 5;

/// Every audio producer in the room, most recently dominant first. Only the
/// first `limit` entries are forwarded; the rest wait in order and move up as
/// listed producers leave.
#[derive(Debug, Clone)]
pub struct ActiveSpeakerList {
    ids: Vec<String>,
    limit: usize,
}

impl Default for ActiveSpeakerList {
    fn default() -> Self {
        Self::with_limit(FAN_OUT_LIMIT)
    }
}

impl ActiveSpeakerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self { ids: Vec::new(), limit }
    }

    /// Number of forwarded producers, never above the limit
    pub fn len(&self) -> usize {
        self.ids.len().min(self.limit)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// True if the producer is among the forwarded ones
    pub fn contains(&self, id: &str) -> bool {
        self.as_slice().iter().any(|p| p == id)
    }

    /// True if the producer is tracked at all, forwarded or waiting
    pub fn tracks(&self, id: &str) -> bool {
        self.ids.iter().any(|p| p == id)
    }

    /// The forwarded producers
    pub fn as_slice(&self) -> &[String] {
        &self.ids[..self.len()]
    }

    /// Producers beyond the limit, in the order they will be admitted
    pub fn waiting(&self) -> &[String] {
        &self.ids[self.len()..]
    }

    /// Appends a new producer. Returns false when it is already tracked.
    pub fn push(&mut self, id: &str) -> bool {
        if self.tracks(id) {
            return false;
        }
        self.ids.push(id.to_string());
        true
    }

    /// Moves a tracked producer to the front, keeping the others in order.
    /// Returns true if the order changed.
    pub fn promote(&mut self, id: &str) -> bool {
        match self.ids.iter().position(|p| p == id) {
            Some(0) | None => false,
            Some(pos) => {
                let promoted = self.ids.remove(pos);
                self.ids.insert(0, promoted);
                true
            }
        }
    }

    /// Promotes a tracked producer, or inserts an untracked one at the front.
    /// The entry pushed past the limit becomes the first waiting one.
    pub fn promote_or_insert(&mut self, id: &str) -> bool {
        if self.tracks(id) {
            return self.promote(id);
        }
        self.ids.insert(0, id.to_string());
        true
    }

    /// Removes a producer; the first waiting one, if any, moves into view
    pub fn remove(&mut self, id: &str) -> bool {
        match self.ids.iter().position(|p| p == id) {
            Some(pos) => {
                self.ids.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Producers a client should be consuming: the forwarded ids minus its own
    pub fn targets_for(&self, own_audio_pid: Option<&str>) -> Vec<String> {
        self.as_slice()
            .iter()
            .filter(|id| Some(id.as_str()) != own_audio_pid)
            .cloned()
            .collect()
    }
}
