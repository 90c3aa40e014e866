//! Source manager: owns source buffers by `file_id`.
//!
//! The source manager outlives every downstream arena by convention (nothing
//! here borrows into any arena); lexeme slices are copied out at lex time
//! (see [`crate::compiler::tokens::Token`]) rather than held as live
//! borrows, so there is no lifetime parameter to thread through the rest of
//! the pipeline.

#[derive(Debug, Default)]
pub struct SourceManager {
    buffers: Vec<String>,
    names: Vec<String>,
}

impl SourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new source buffer and returns its `file_id`. `file_id` 0
    /// is reserved as "unknown" and is never handed out here.
    pub fn add_file(&mut self, name: impl Into<String>, text: impl Into<String>) -> u32 {
        self.buffers.push(text.into());
        self.names.push(name.into());
        self.buffers.len() as u32
    }

    pub fn text(&self, file_id: u32) -> &str {
        if file_id == 0 {
            return "";
        }
        self.buffers
            .get((file_id - 1) as usize)
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn name(&self, file_id: u32) -> &str {
        if file_id == 0 {
            return "<unknown>";
        }
        self.names
            .get((file_id - 1) as usize)
            .map(String::as_str)
            .unwrap_or("<unknown>")
    }
}
