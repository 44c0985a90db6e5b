use std::fmt::{Display, Formatter};

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
/// A raw `ra_svn` wire item.
///
/// Most callers go through [`crate::RaSvnSession`] or bind items to a
/// [`Template`](super::template::Template) instead of matching on this
/// directly.
pub enum SvnItem {
    /// A word token such as `success` or `edit-pipeline`.
    Word(String),
    /// A non-negative number.
    Number(u64),
    /// A length-prefixed string. Raw bytes; may not be valid UTF-8.
    String(Vec<u8>),
    /// A parenthesized list.
    List(Vec<SvnItem>),
    /// `true` or `false`.
    Bool(bool),
}

impl SvnItem {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            SvnItem::Word(_) => "word",
            SvnItem::Number(_) => "number",
            SvnItem::String(_) => "string",
            SvnItem::List(_) => "list",
            SvnItem::Bool(_) => "bool",
        }
    }

    /// A string item holding `s`.
    pub fn string(s: impl AsRef<[u8]>) -> Self {
        SvnItem::String(s.as_ref().to_vec())
    }

    /// A word item.
    pub fn word(w: impl Into<String>) -> Self {
        SvnItem::Word(w.into())
    }

    /// Returns the word, if this is a word.
    pub fn as_word(&self) -> Option<&str> {
        match self {
            SvnItem::Word(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the number, if this is a number.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            SvnItem::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the boolean, if this is a boolean or a boolean word.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SvnItem::Bool(b) => Some(*b),
            SvnItem::Word(w) if w == "true" => Some(true),
            SvnItem::Word(w) if w == "false" => Some(false),
            _ => None,
        }
    }

    /// Returns the string as UTF-8, if this is a string and decodes.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SvnItem::String(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    /// Returns the raw bytes, if this is a string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            SvnItem::String(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the elements, if this is a list.
    pub fn as_list(&self) -> Option<&[SvnItem]> {
        match self {
            SvnItem::List(items) => Some(items),
            _ => None,
        }
    }

    /// Appends the wire encoding, followed by a single space.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            SvnItem::Word(w) => {
                out.extend_from_slice(w.as_bytes());
                out.push(b' ');
            }
            SvnItem::Number(n) => {
                write_decimal(*n, out);
                out.push(b' ');
            }
            SvnItem::Bool(b) => {
                out.extend_from_slice(if *b { b"true " } else { b"false " });
            }
            SvnItem::String(s) => {
                write_decimal(s.len() as u64, out);
                out.push(b':');
                out.extend_from_slice(s);
                out.push(b' ');
            }
            SvnItem::List(items) => {
                out.extend_from_slice(b"( ");
                for item in items {
                    item.encode(out);
                }
                out.extend_from_slice(b") ");
            }
        }
    }
}

impl Display for SvnItem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SvnItem::Word(w) => write!(f, "{w}"),
            SvnItem::Number(n) => write!(f, "{n}"),
            SvnItem::String(s) => write!(f, "<{} bytes>", s.len()),
            SvnItem::List(items) => write!(f, "({} items)", items.len()),
            SvnItem::Bool(b) => write!(f, "{b}"),
        }
    }
}

fn write_decimal(mut n: u64, out: &mut Vec<u8>) {
    let mut buf = [0u8; 20];
    let mut i = buf.len();
    loop {
        i -= 1;
        buf[i] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    out.extend_from_slice(&buf[i..]);
}

/// Encodes `( command params ) ` plus the terminating newline.
pub(crate) fn encode_command(command: &str, params: &SvnItem, out: &mut Vec<u8>) {
    out.extend_from_slice(b"( ");
    out.extend_from_slice(command.as_bytes());
    out.push(b' ');
    params.encode(out);
    out.extend_from_slice(b") \n");
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn encoded(item: &SvnItem) -> Vec<u8> {
        let mut bytes = Vec::new();
        item.encode(&mut bytes);
        bytes
    }

    #[test]
    fn codec_encodes_expected_bytes() {
        let item = SvnItem::List(vec![
            SvnItem::word("word"),
            SvnItem::Number(22),
            SvnItem::Number(0),
            SvnItem::string("string"),
            SvnItem::List(vec![SvnItem::word("sublist")]),
            SvnItem::Bool(false),
        ]);
        assert_eq!(encoded(&item), b"( word 22 0 6:string ( sublist ) false ) ");
    }

    #[test]
    fn command_ends_with_newline() {
        let mut bytes = Vec::new();
        encode_command(
            "check-path",
            &SvnItem::List(vec![SvnItem::string("trunk"), SvnItem::List(Vec::new())]),
            &mut bytes,
        );
        assert_eq!(bytes, b"( check-path ( 5:trunk ( ) ) ) \n");
    }

    #[test]
    fn anonymous_auth_response_carries_an_empty_token() {
        let item = SvnItem::List(vec![
            SvnItem::word("ANONYMOUS"),
            SvnItem::List(vec![SvnItem::String(Vec::new())]),
        ]);
        assert_eq!(encoded(&item), b"( ANONYMOUS ( 0: ) ) ");
    }

    #[test]
    fn plain_token_is_binary_safe() {
        let item = SvnItem::List(vec![
            SvnItem::word("PLAIN"),
            SvnItem::List(vec![SvnItem::String(vec![0, b'u', 0, b'p'])]),
        ]);
        let mut expected = b"( PLAIN ( 4:".to_vec();
        expected.extend_from_slice(&[0, b'u', 0, b'p']);
        expected.extend_from_slice(b" ) ) ");
        assert_eq!(encoded(&item), expected);
    }

    #[test]
    fn accessors_borrow() {
        let item = SvnItem::List(vec![SvnItem::string("caf\u{e9}"), SvnItem::String(vec![0xff])]);
        let list = item.as_list().unwrap();
        assert_eq!(list[0].as_str(), Some("caf\u{e9}"));
        assert_eq!(list[1].as_str(), None);
        assert_eq!(list[1].as_bytes(), Some(&[0xff][..]));
        assert_eq!(SvnItem::word("true").as_bool(), Some(true));
        assert_eq!(item.to_string(), "(2 items)");
    }
}
