//! Collaborative plain text: a list of grapheme clusters.

use std::fmt;
use std::ops::Range;

use serde_json::Value;
use unicode_segmentation::UnicodeSegmentation;

use crate::header::DocKind;
use crate::list::CoList;
use crate::list::ListError;
use crate::log::DocLog;
use crate::log::Privacy;
use crate::log::Session;

/// Text editing on top of a [`CoList`] whose elements are single
/// graphemes. Positions count graphemes, not bytes or chars.
pub struct CoPlainText {
    list: CoList,
}

impl CoPlainText {
    pub fn new(log: DocLog, session: Session) -> Result<CoPlainText, ListError> {
        return CoPlainText::from_list(CoList::new(log, session)?);
    }

    pub fn from_list(list: CoList) -> Result<CoPlainText, ListError> {
        if list.kind() != DocKind::PlainText {
            return Err(ListError::WrongKind {
                expected: DocKind::PlainText,
                found: list.kind(),
            });
        }
        return Ok(CoPlainText { list });
    }

    pub fn list(&self) -> &CoList {
        return &self.list;
    }

    pub fn list_mut(&mut self) -> &mut CoList {
        return &mut self.list;
    }

    pub fn into_list(self) -> CoList {
        return self.list;
    }

    /// Length in graphemes.
    pub fn len(&self) -> usize {
        return self.list.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.list.is_empty();
    }

    /// Insert `text` so that its first grapheme ends up at `index`.
    pub fn insert(&mut self, index: usize, text: &str, privacy: Privacy) -> Result<(), ListError> {
        let graphemes: Vec<Value> = text.graphemes(true).map(|g| Value::String(g.to_string())).collect();
        if graphemes.is_empty() {
            return Ok(());
        }
        let len = self.len();
        if index > len {
            return Err(ListError::IndexOutOfRange { index, len });
        }
        if index == 0 && len > 0 {
            self.list.prepend_items(graphemes, Some(0), privacy)?;
        } else {
            self.list.append_items(graphemes, index.checked_sub(1), privacy)?;
        }
        return Ok(());
    }

    pub fn push_str(&mut self, text: &str, privacy: Privacy) -> Result<(), ListError> {
        return self.insert(self.len(), text, privacy);
    }

    /// Delete the graphemes in `range`.
    pub fn delete(&mut self, range: Range<usize>, privacy: Privacy) -> Result<(), ListError> {
        self.list.delete_range(range, privacy)?;
        return Ok(());
    }
}

impl fmt::Display for CoPlainText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for value in self.list.as_array() {
            if let Some(s) = value.as_str() {
                f.write_str(s)?;
            }
        }
        return Ok(());
    }
}

impl fmt::Debug for CoPlainText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "CoPlainText({:?})", self.to_string());
    }
}
