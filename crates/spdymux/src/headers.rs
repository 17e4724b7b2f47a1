use std::fmt;

use bytes::Bytes;

use crate::error::StreamProtocolError;

/// A decoded header block: name/value pairs in wire order.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    fields: Vec<(Bytes, Bytes)>,
}

impl HeaderBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Builder-style [HeaderBlock::push]
    pub fn with(mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.push(name, value);
        self
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.fields
            .iter()
            .find(|(n, _)| &n[..] == name.as_bytes())
            .map(|(_, v)| v)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.fields.iter().map(|(n, v)| (&n[..], &v[..]))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Value of `:status`, if present and numeric
    pub fn status(&self) -> Option<u16> {
        self.get_str(":status").and_then(|s| s.parse().ok())
    }

    /// Rejects uppercase names, repeated pseudo-headers and pseudo-headers
    /// that follow regular fields. Regular fields may repeat.
    pub(crate) fn validate(&self) -> Result<(), StreamProtocolError> {
        let mut saw_regular = false;
        for (i, (name, _)) in self.fields.iter().enumerate() {
            if name.iter().any(|b| b.is_ascii_uppercase()) {
                return Err(StreamProtocolError::UppercaseHeaderName {
                    name: String::from_utf8_lossy(name).into_owned(),
                });
            }

            if name.first() == Some(&b':') {
                if saw_regular {
                    return Err(StreamProtocolError::PseudoHeaderAfterRegular {
                        name: String::from_utf8_lossy(name).into_owned(),
                    });
                }
                if self.fields[..i].iter().any(|(prev, _)| prev == name) {
                    return Err(StreamProtocolError::DuplicatePseudoHeader {
                        name: String::from_utf8_lossy(name).into_owned(),
                    });
                }
            } else {
                saw_regular = true;
            }
        }
        Ok(())
    }
}

impl<N, V> FromIterator<(N, V)> for HeaderBlock
where
    N: Into<Bytes>,
    V: Into<Bytes>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut block = Self::new();
        for (n, v) in iter {
            block.push(n, v);
        }
        block
    }
}

impl fmt::Debug for HeaderBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut m = f.debug_map();
        for (n, v) in self.fields.iter() {
            m.entry(&String::from_utf8_lossy(n), &String::from_utf8_lossy(v));
        }
        m.finish()
    }
}
