//! Incremental segmentation of streamed LLM text.
//!
//! Text arrives in arbitrary fragments. The segmenter passes prose through as
//! soon as it is known not to start a code fence, and holds fenced blocks back
//! until they close so that a proposed query is only ever seen whole.

use regex::Regex;
use std::sync::OnceLock;

use crate::db::EngineKind;

const FENCE: &str = "```";

fn opening_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^```[ \t]*([A-Za-z0-9_+-]*)[^\n]*\n").expect("fence pattern is valid")
    })
}

/// A piece of classified AI output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Prose(String),
    /// A fenced block in one of the engine's query languages.
    Query { language: String, text: String },
}

#[derive(Debug)]
enum State {
    Prose,
    Fence { language: String, header: String },
}

/// Splits streamed text into prose and query segments.
#[derive(Debug)]
pub struct ResponseSegmenter {
    languages: &'static [&'static str],
    buffer: String,
    state: State,
}

impl ResponseSegmenter {
    pub fn for_engine(engine: EngineKind) -> Self {
        let languages: &'static [&'static str] = if engine.is_sql() {
            &["sql", "postgresql", "postgres", "pgsql", "sqlite"]
        } else {
            &["json", "mongodb", "mongo"]
        };
        Self {
            languages,
            buffer: String::new(),
            state: State::Prose,
        }
    }

    fn is_query_language(&self, language: &str) -> bool {
        let language = language.to_lowercase();
        self.languages.contains(&language.as_str())
    }

    /// Feeds one fragment, returning every segment that is now complete.
    pub fn push(&mut self, fragment: &str) -> Vec<Segment> {
        self.buffer.push_str(fragment);
        let mut out = Vec::new();

        loop {
            match &self.state {
                State::Prose => {
                    if let Some(start) = self.buffer.find(FENCE) {
                        if start > 0 {
                            out.push(Segment::Prose(self.buffer[..start].to_string()));
                            self.buffer.drain(..start);
                        }
                        let Some(header) = opening_fence().captures(&self.buffer) else {
                            // Opening line not complete yet
                            break;
                        };
                        let header_len = header[0].len();
                        let language = header[1].to_string();
                        let header = header[0].to_string();
                        self.buffer.drain(..header_len);
                        self.state = State::Fence { language, header };
                    } else {
                        // Hold back a trailing partial fence
                        let keep = trailing_backticks(&self.buffer).min(FENCE.len() - 1);
                        let emit = self.buffer.len() - keep;
                        if emit > 0 {
                            out.push(Segment::Prose(self.buffer[..emit].to_string()));
                            self.buffer.drain(..emit);
                        }
                        break;
                    }
                }
                State::Fence { language, header } => {
                    let Some(end) = self.buffer.find(FENCE) else {
                        break;
                    };
                    let body = self.buffer[..end].to_string();
                    let segment = if self.is_query_language(language) {
                        Segment::Query {
                            language: language.to_lowercase(),
                            text: body.trim().to_string(),
                        }
                    } else {
                        Segment::Prose(format!("{header}{body}{FENCE}"))
                    };
                    out.push(segment);
                    self.buffer.drain(..end + FENCE.len());
                    self.state = State::Prose;
                }
            }
        }
        out
    }

    /// Flushes whatever is left once the stream ends.
    ///
    /// An unterminated fence is returned as prose, never as a query.
    pub fn finish(&mut self) -> Vec<Segment> {
        let rest = std::mem::take(&mut self.buffer);
        let text = match std::mem::replace(&mut self.state, State::Prose) {
            State::Prose => rest,
            State::Fence { header, .. } => format!("{header}{rest}"),
        };
        if text.is_empty() {
            Vec::new()
        } else {
            vec![Segment::Prose(text)]
        }
    }
}

fn trailing_backticks(text: &str) -> usize {
    text.bytes().rev().take_while(|b| *b == b'`').count()
}
