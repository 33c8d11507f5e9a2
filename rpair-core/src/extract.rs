//! R code extraction from LLM output
//!
//! The coder is told to put its R code in a fenced block:
//!
//! ````text
//! ```r
//! summary(mtcars)
//! ```
//! ````
//!
//! Only the first R block is used. Fences tagged with other languages are
//! skipped, and R Markdown chunk headers (`{r}`, `{r setup, echo=FALSE}`)
//! count as R.

use regex::Regex;
use std::sync::LazyLock;

static R_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*```[ \t]*(?:[rR]|\{[rR](?:[ \t,][^}\n]*)?\})[ \t]*\r?\n([\s\S]*?)```")
        .expect("R fence pattern is valid")
});

/// Outcome of scanning a message for R code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Found { code: String },
    NotFound,
}

impl Extraction {
    pub fn is_found(&self) -> bool {
        matches!(self, Extraction::Found { .. })
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Extraction::Found { code } => Some(code),
            Extraction::NotFound => None,
        }
    }

    pub fn into_code(self) -> Option<String> {
        match self {
            Extraction::Found { code } => Some(code),
            Extraction::NotFound => None,
        }
    }
}

/// Return the trimmed contents of the first R-tagged fenced block in `text`.
pub fn extract_r_code(text: &str) -> Extraction {
    match R_FENCE.captures(text).and_then(|caps| caps.get(1)) {
        Some(body) => Extraction::Found {
            code: body.as_str().trim().to_string(),
        },
        None => Extraction::NotFound,
    }
}

/// Number of complete R-tagged fenced blocks in `text`.
pub fn count_r_blocks(text: &str) -> usize {
    R_FENCE.find_iter(text).count()
}
