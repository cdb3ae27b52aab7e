//! Prompt-delimited framing for the interactive evaluator.
//!
//! The evaluator has no message envelope: it prints whatever the snippet
//! produced and then its prompt again. A turn is therefore complete when
//! the accumulated output ends with the prompt marker (optionally followed
//! by whitespace). There are no request identifiers on the wire, so at most
//! one evaluation can be outstanding at a time.

use std::borrow::Cow;

use regex::Regex;

/// Default prompt printed by the evaluator when it is ready for input.
pub const DEFAULT_PROMPT: &str = "ترقيم>";

/// Default welcome line printed once at session start.
pub const DEFAULT_BANNER: &str = "مرحباً بك في ترقيم";

/// Default error markers, one per supported locale.
pub const DEFAULT_ERROR_MARKERS: &[&str] = &["خطأ", "Error"];

/// Prefix of the line that carries an expression's value.
pub const RETURN_MARKER: &str = "=> ";

/// Result of classifying one completed turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvalOutcome {
    pub success: bool,
    /// Text printed as a side effect of the evaluation.
    pub output: String,
    /// Value of the final expression, when the evaluator reported one.
    pub return_value: Option<String>,
    /// Error text starting at the first error marker line.
    pub error: Option<String>,
}

/// Locale-specific markers that give shape to the evaluator's output.
#[derive(Debug, Clone)]
pub struct PromptSyntax {
    prompt: String,
    banner: Option<String>,
    error_pattern: Option<Regex>,
}

impl PromptSyntax {
    /// Build a syntax from a prompt, optional banner, and error markers.
    ///
    /// Each marker matches at the start of a line (leading whitespace
    /// allowed).
    pub fn new<S: AsRef<str>>(
        prompt: impl Into<String>,
        banner: Option<String>,
        error_markers: &[S],
    ) -> Result<Self, regex::Error> {
        let alternation = error_markers
            .iter()
            .map(|m| regex::escape(m.as_ref()))
            .collect::<Vec<_>>()
            .join("|");
        let error_pattern = if alternation.is_empty() {
            None
        } else {
            Some(Regex::new(&format!(r"(?m)^[ \t]*(?:{alternation})"))?)
        };

        Ok(Self {
            prompt: prompt.into(),
            banner: banner.filter(|b| !b.is_empty()),
            error_pattern,
        })
    }

    #[must_use]
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Length of the completed turn in `bytes`, excluding the trailing
    /// prompt, if `bytes` ends with the prompt marker.
    fn turn_len(&self, bytes: &[u8]) -> Option<usize> {
        let trimmed_len = bytes
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map_or(0, |pos| pos + 1);
        let prompt = self.prompt.as_bytes();
        if prompt.is_empty() || !bytes[..trimmed_len].ends_with(prompt) {
            return None;
        }
        Some(trimmed_len - prompt.len())
    }

    /// Remove the first line carrying the welcome banner.
    ///
    /// Only the turn that precedes the first prompt should pass through
    /// here; later output is the user's and is kept verbatim.
    #[must_use]
    pub fn strip_banner<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let Some(banner) = self.banner.as_deref() else {
            return text.into();
        };
        let mut lines: Vec<&str> = text.lines().collect();
        match lines.iter().position(|line| line.contains(banner)) {
            Some(idx) => {
                lines.remove(idx);
                lines.join("\n").into()
            }
            None => text.into(),
        }
    }

    /// Classify a completed turn (prompt already removed).
    ///
    /// An error marker at the start of any line makes the turn a failure;
    /// otherwise the last `=> value` line is the return value and every
    /// other line is side output.
    #[must_use]
    pub fn classify(&self, text: &str) -> EvalOutcome {
        let text = text.trim_end();

        if let Some(found) = self.error_pattern.as_ref().and_then(|p| p.find(text)) {
            let line_start = text[..found.start()].rfind('\n').map_or(0, |i| i + 1);
            return EvalOutcome {
                success: false,
                output: text[..line_start].trim_end().to_string(),
                return_value: None,
                error: Some(text[line_start..].trim().to_string()),
            };
        }

        let lines: Vec<&str> = text.lines().map(|l| l.trim_end_matches('\r')).collect();
        let value_line = lines
            .iter()
            .rposition(|line| line.starts_with(RETURN_MARKER.trim_end()));

        match value_line {
            Some(idx) => {
                let value = lines[idx][RETURN_MARKER.trim_end().len()..].trim();
                let output = lines
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != idx)
                    .map(|(_, line)| *line)
                    .collect::<Vec<_>>()
                    .join("\n");
                EvalOutcome {
                    success: true,
                    output: output.trim().to_string(),
                    return_value: Some(value.to_string()),
                    error: None,
                }
            }
            None => EvalOutcome {
                success: true,
                output: text.trim_start_matches(['\r', '\n']).to_string(),
                return_value: None,
                error: None,
            },
        }
    }
}

impl Default for PromptSyntax {
    fn default() -> Self {
        Self::new(
            DEFAULT_PROMPT,
            Some(DEFAULT_BANNER.to_string()),
            DEFAULT_ERROR_MARKERS,
        )
        .expect("default error markers form a valid pattern")
    }
}

/// Accumulates evaluator output until the prompt reappears.
///
/// Bytes are kept raw so a multi-byte character split across two reads is
/// reassembled before any text is produced.
#[derive(Debug, Default)]
pub struct PromptDecoder {
    buffer: Vec<u8>,
    syntax: PromptSyntax,
}

impl PromptDecoder {
    #[must_use]
    pub fn new(syntax: PromptSyntax) -> Self {
        Self {
            buffer: Vec::new(),
            syntax,
        }
    }

    #[must_use]
    pub fn syntax(&self) -> &PromptSyntax {
        &self.syntax
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// If the accumulated output ends with the prompt, take it as one turn.
    ///
    /// The returned text excludes the prompt; the accumulator is cleared.
    pub fn take_turn(&mut self) -> Option<String> {
        let len = self.syntax.turn_len(&self.buffer)?;
        let text = String::from_utf8_lossy(&self.buffer[..len]).into_owned();
        self.buffer.clear();
        Some(text)
    }

    /// Append `chunk` and take a completed turn if it ends one.
    pub fn push(&mut self, chunk: &[u8]) -> Option<String> {
        self.extend(chunk);
        self.take_turn()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
