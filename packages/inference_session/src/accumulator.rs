/// Durable record of one generation's output.
///
/// Updated by the controller for every fragment it accepts, before the
/// fragment is published to live subscribers, so the final text never depends
/// on what a slow subscriber managed to observe.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultAccumulator {
    text: String,
    token_count: u64,
}

impl ResultAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh generation
    pub fn reset(&mut self) {
        self.text.clear();
        self.token_count = 0;
    }

    /// Record one delivered fragment
    pub fn append(&mut self, fragment: &str) {
        self.text.push_str(fragment);
        self.token_count += 1;
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn token_count(&self) -> u64 {
        self.token_count
    }

    pub fn is_empty(&self) -> bool {
        self.token_count == 0
    }
}
