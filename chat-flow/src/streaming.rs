use serde::{Deserialize, Serialize};

/// Unit in which a finished answer is streamed into the chat history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamGranularity {
    #[default]
    Character,
    /// A word together with the whitespace that follows it.
    Word,
}

impl std::str::FromStr for StreamGranularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "character" | "char" => Ok(Self::Character),
            "word" => Ok(Self::Word),
            other => Err(format!("unknown stream granularity {other:?}")),
        }
    }
}

/// Lazy, single-pass split of an answer. Concatenating every chunk yields the
/// original string.
#[derive(Debug, Clone)]
pub struct AnswerChunks<'a> {
    rest: &'a str,
    granularity: StreamGranularity,
}

impl<'a> AnswerChunks<'a> {
    pub fn new(answer: &'a str, granularity: StreamGranularity) -> Self {
        Self {
            rest: answer,
            granularity,
        }
    }
}

impl<'a> Iterator for AnswerChunks<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.rest.chars().next()?;
        let end = match self.granularity {
            StreamGranularity::Character => first.len_utf8(),
            StreamGranularity::Word => word_end(self.rest),
        };
        let (chunk, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(chunk)
    }
}

/// Byte offset just past the leading word and its trailing whitespace.
fn word_end(s: &str) -> usize {
    let mut seen_space = false;
    for (index, c) in s.char_indices() {
        if c.is_whitespace() {
            seen_space = true;
        } else if seen_space {
            return index;
        }
    }
    s.len()
}
