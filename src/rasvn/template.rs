//! Positional templates for `ra_svn` tuples.
//!
//! A template describes the shape of one list on the wire:
//!
//! | token | meaning |
//! |-------|---------|
//! | `w`   | word |
//! | `n`   | number |
//! | `s`   | UTF-8 string |
//! | `b`   | byte string |
//! | `t`   | boolean |
//! | `(…)` | nested list |
//! | `?`   | every element after this point is optional |
//! | `*`   | the next element repeats until the end of the list |
//!
//! The outermost parentheses are implied: `"nn(*w)(*w)"` matches the
//! greeting tuple `( 2 2 ( ) ( edit-pipeline svndiff1 ) )`.

use crate::SvnError;

use super::SvnItem;

/// A value bound to one template position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Slot {
    /// `w`
    Word(String),
    /// `n`
    Number(u64),
    /// `s`
    String(String),
    /// `b`
    Bytes(Vec<u8>),
    /// `t`
    Bool(bool),
    /// A nested list, or the values matched by a `*` element.
    List(Vec<Slot>),
    /// An optional element that was not present.
    Absent,
}

impl Slot {
    /// Returns `true` for [`Slot::Absent`].
    pub fn is_absent(&self) -> bool {
        matches!(self, Slot::Absent)
    }

    /// Returns the word, if this slot is a word.
    pub fn as_word(&self) -> Option<&str> {
        match self {
            Slot::Word(word) => Some(word),
            _ => None,
        }
    }

    /// Returns the number, if this slot is a number.
    pub fn as_number(&self) -> Option<u64> {
        match self {
            Slot::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the string, if this slot is a UTF-8 string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Slot::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the raw bytes of a byte string or UTF-8 string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Slot::Bytes(bytes) => Some(bytes),
            Slot::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Returns the boolean, if this slot is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Slot::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the elements, if this slot is a list.
    pub fn as_list(&self) -> Option<&[Slot]> {
        match self {
            Slot::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns every word of a list slot. Anything else yields an empty vector.
    pub fn words(&self) -> Vec<String> {
        self.as_list()
            .unwrap_or_default()
            .iter()
            .filter_map(|slot| slot.as_word().map(str::to_string))
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Word,
    Number,
    String,
    Bytes,
    Bool,
    List(Template),
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Element {
    token: Token,
    repeated: bool,
}

/// A parsed template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Template {
    elements: Vec<Element>,
    optional_from: Option<usize>,
}

impl Template {
    /// Parses a template string.
    pub fn parse(template: &str) -> Result<Self, SvnError> {
        let mut chars = template.bytes().peekable();
        let parsed = Self::parse_group(&mut chars, template)?;
        if chars.next().is_some() {
            return Err(invalid(template, "unbalanced `)`"));
        }
        Ok(parsed)
    }

    fn parse_group(
        chars: &mut std::iter::Peekable<std::str::Bytes<'_>>,
        template: &str,
    ) -> Result<Self, SvnError> {
        let mut elements = Vec::new();
        let mut optional_from = None;
        let mut repeated = false;
        while let Some(&c) = chars.peek() {
            if c == b')' {
                break;
            }
            chars.next();
            let token = match c {
                b'w' => Token::Word,
                b'n' => Token::Number,
                b's' => Token::String,
                b'b' => Token::Bytes,
                b't' => Token::Bool,
                b'(' => {
                    let inner = Self::parse_group(chars, template)?;
                    if chars.next() != Some(b')') {
                        return Err(invalid(template, "missing `)`"));
                    }
                    Token::List(inner)
                }
                b'?' => {
                    if optional_from.is_some() {
                        return Err(invalid(template, "duplicate `?`"));
                    }
                    optional_from = Some(elements.len());
                    continue;
                }
                b'*' => {
                    repeated = true;
                    continue;
                }
                b' ' => continue,
                other => {
                    return Err(invalid(
                        template,
                        &format!("unknown token `{}`", other as char),
                    ));
                }
            };
            if elements.last().is_some_and(|e: &Element| e.repeated) {
                return Err(invalid(template, "`*` element must end its list"));
            }
            elements.push(Element { token, repeated });
            repeated = false;
        }
        if repeated {
            return Err(invalid(template, "`*` without an element"));
        }
        Ok(Self {
            elements,
            optional_from,
        })
    }

    /// `(*x)`: a list made only of one repeated element.
    fn is_repetition(&self) -> bool {
        matches!(self.elements.as_slice(), [Element { repeated: true, .. }])
    }

    fn is_optional(&self, index: usize) -> bool {
        self.optional_from.is_some_and(|from| index >= from)
    }

    /// Matches the elements of a wire list against this template.
    ///
    /// The result has one slot per template element. Missing optional
    /// elements become [`Slot::Absent`]; extra trailing items are ignored so
    /// newer servers may append fields.
    pub fn unmarshal(&self, items: &[SvnItem]) -> Result<Vec<Slot>, SvnError> {
        let mut slots = Vec::with_capacity(self.elements.len());
        for (index, element) in self.elements.iter().enumerate() {
            if element.repeated {
                let rest = items.get(index..).unwrap_or_default();
                let repeated = rest
                    .iter()
                    .map(|item| element.token.unmarshal(item))
                    .collect::<Result<Vec<_>, _>>()?;
                slots.push(Slot::List(repeated));
                continue;
            }
            match items.get(index) {
                Some(item) => slots.push(element.token.unmarshal(item)?),
                None if self.is_optional(index) => slots.push(Slot::Absent),
                None => {
                    return Err(SvnError::Protocol(format!(
                        "tuple too short: expected {} at position {index}",
                        element.token.name()
                    )));
                }
            }
        }
        Ok(slots)
    }

    /// Builds a wire list from slots bound to this template.
    ///
    /// Optional positions may be left out or set to [`Slot::Absent`]; once an
    /// optional element is absent, the remaining elements are not written.
    pub fn marshal(&self, slots: &[Slot]) -> Result<SvnItem, SvnError> {
        let mut items = Vec::with_capacity(self.elements.len());
        for (index, element) in self.elements.iter().enumerate() {
            let slot = slots.get(index).unwrap_or(&Slot::Absent);
            if slot.is_absent() {
                if self.is_optional(index) {
                    break;
                }
                if element.repeated {
                    continue;
                }
                return Err(SvnError::Protocol(format!(
                    "missing required {} at position {index}",
                    element.token.name()
                )));
            }
            if element.repeated {
                let values = slot.as_list().ok_or_else(|| {
                    SvnError::Protocol(format!("repeated element {index} needs a list"))
                })?;
                for value in values {
                    items.push(element.token.marshal(value)?);
                }
            } else {
                items.push(element.token.marshal(slot)?);
            }
        }
        Ok(SvnItem::List(items))
    }
}

impl Token {
    fn name(&self) -> &'static str {
        match self {
            Token::Word => "word",
            Token::Number => "number",
            Token::String => "string",
            Token::Bytes => "byte string",
            Token::Bool => "boolean",
            Token::List(_) => "list",
        }
    }

    fn unmarshal(&self, item: &SvnItem) -> Result<Slot, SvnError> {
        let slot = match (self, item) {
            (Token::Word, SvnItem::Word(word)) => Slot::Word(word.clone()),
            (Token::Word, SvnItem::Bool(b)) => Slot::Word(b.to_string()),
            (Token::Number, SvnItem::Number(n)) => Slot::Number(*n),
            (Token::String, SvnItem::String(bytes)) => Slot::String(
                String::from_utf8(bytes.clone())
                    .map_err(|_| SvnError::Protocol("string is not valid UTF-8".into()))?,
            ),
            (Token::Bytes, SvnItem::String(bytes)) => Slot::Bytes(bytes.clone()),
            (Token::Bool, item) => {
                Slot::Bool(item.as_bool().ok_or_else(|| mismatch(self, item))?)
            }
            (Token::List(inner), SvnItem::List(items)) => {
                let mut slots = inner.unmarshal(items)?;
                match slots.pop() {
                    Some(repeated) if inner.is_repetition() => repeated,
                    Some(last) => {
                        slots.push(last);
                        Slot::List(slots)
                    }
                    None => Slot::List(slots),
                }
            }
            (_, item) => return Err(mismatch(self, item)),
        };
        Ok(slot)
    }

    fn marshal(&self, slot: &Slot) -> Result<SvnItem, SvnError> {
        let item = match (self, slot) {
            (Token::Word, Slot::Word(word)) => SvnItem::Word(word.clone()),
            (Token::Number, Slot::Number(n)) => SvnItem::Number(*n),
            (Token::String | Token::Bytes, Slot::String(s)) => {
                SvnItem::String(s.as_bytes().to_vec())
            }
            (Token::Bytes, Slot::Bytes(bytes)) => SvnItem::String(bytes.clone()),
            (Token::Bool, Slot::Bool(b)) => SvnItem::Bool(*b),
            (Token::List(inner), Slot::List(_)) if inner.is_repetition() => {
                inner.marshal(std::slice::from_ref(slot))?
            }
            (Token::List(inner), Slot::List(slots)) => inner.marshal(slots)?,
            (token, slot) => {
                return Err(SvnError::Protocol(format!(
                    "cannot write {slot:?} as {}",
                    token.name()
                )));
            }
        };
        Ok(item)
    }
}

fn mismatch(token: &Token, item: &SvnItem) -> SvnError {
    SvnError::Protocol(format!("expected {}, found {}", token.name(), item.kind()))
}

fn invalid(template: &str, reason: &str) -> SvnError {
    SvnError::Protocol(format!("invalid template {template:?}: {reason}"))
}

/// Parses `template` and matches it against a wire list.
pub fn unmarshal(template: &str, item: &SvnItem) -> Result<Vec<Slot>, SvnError> {
    let SvnItem::List(items) = item else {
        return Err(SvnError::Protocol(format!(
            "expected list for {template:?}, found {}",
            item.kind()
        )));
    };
    Template::parse(template)?.unmarshal(items)
}

/// Parses `template` and builds a wire list from `slots`.
pub fn marshal(template: &str, slots: &[Slot]) -> Result<SvnItem, SvnError> {
    Template::parse(template)?.marshal(slots)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn word(w: &str) -> SvnItem {
        SvnItem::Word(w.to_string())
    }

    fn string(s: &str) -> SvnItem {
        SvnItem::String(s.as_bytes().to_vec())
    }

    #[test]
    fn greeting_tuple() {
        let item = SvnItem::List(vec![
            SvnItem::Number(2),
            SvnItem::Number(2),
            SvnItem::List(Vec::new()),
            SvnItem::List(vec![word("edit-pipeline"), word("svndiff1")]),
        ]);
        let slots = unmarshal("nn(*w)(*w)", &item).unwrap();
        assert_eq!(slots[0].as_number(), Some(2));
        assert_eq!(slots[2].words(), Vec::<String>::new());
        assert_eq!(slots[3].words(), vec!["edit-pipeline", "svndiff1"]);
    }

    #[test]
    fn optional_tail_becomes_absent() {
        let item = SvnItem::List(vec![string("uuid")]);
        let slots = unmarshal("s?s(*w)", &item).unwrap();
        assert_eq!(slots[0].as_str(), Some("uuid"));
        assert!(slots[1].is_absent());
        assert!(slots[2].is_absent());
    }

    #[test]
    fn required_element_missing_is_an_error() {
        let item = SvnItem::List(vec![word("step")]);
        let err = unmarshal("w(b)", &item).unwrap_err();
        assert!(matches!(err, SvnError::Protocol(msg) if msg.contains("position 1")));
    }

    #[test]
    fn challenge_with_optional_token() {
        let item = SvnItem::List(vec![word("step"), SvnItem::List(vec![string("<1.2@host>")])]);
        let slots = unmarshal("w?(?b)", &item).unwrap();
        assert_eq!(slots[0].as_word(), Some("step"));
        let token = slots[1].as_list().unwrap();
        assert_eq!(token[0].as_bytes(), Some(&b"<1.2@host>"[..]));

        let bare = SvnItem::List(vec![word("success")]);
        let slots = unmarshal("w?(?b)", &bare).unwrap();
        assert!(slots[1].is_absent());
    }

    #[test]
    fn repeated_lists() {
        let item = SvnItem::List(vec![
            SvnItem::List(vec![string("a"), SvnItem::Number(1)]),
            SvnItem::List(vec![string("b"), SvnItem::Number(2)]),
        ]);
        let slots = unmarshal("*(sn)", &item).unwrap();
        let pairs = slots[0].as_list().unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].as_list().unwrap()[0].as_str(), Some("b"));
    }

    #[test]
    fn type_mismatch_is_reported() {
        let item = SvnItem::List(vec![string("2")]);
        let err = unmarshal("n", &item).unwrap_err();
        assert!(matches!(err, SvnError::Protocol(msg) if msg == "expected number, found string"));
    }

    #[test]
    fn booleans_accept_words() {
        let item = SvnItem::List(vec![word("true"), SvnItem::Bool(false)]);
        let slots = unmarshal("tt", &item).unwrap();
        assert_eq!(slots, vec![Slot::Bool(true), Slot::Bool(false)]);
    }

    #[test]
    fn extra_items_are_ignored() {
        let item = SvnItem::List(vec![SvnItem::Number(7), word("future")]);
        assert_eq!(unmarshal("n", &item).unwrap(), vec![Slot::Number(7)]);
    }

    #[test]
    fn marshal_client_greeting() {
        let item = marshal(
            "n(*w)ss()",
            &[
                Slot::Number(2),
                Slot::List(vec![Slot::Word("edit-pipeline".into())]),
                Slot::String("svn://h:3690/r".into()),
                Slot::String("svn-core".into()),
                Slot::List(Vec::new()),
            ],
        )
        .unwrap();
        assert_eq!(
            item,
            SvnItem::List(vec![
                SvnItem::Number(2),
                SvnItem::List(vec![word("edit-pipeline")]),
                string("svn://h:3690/r"),
                string("svn-core"),
                SvnItem::List(Vec::new()),
            ])
        );
    }

    #[test]
    fn marshal_stops_at_first_absent_optional() {
        let item = marshal("s(?n)", &[Slot::String("trunk".into()), Slot::List(vec![])]).unwrap();
        assert_eq!(
            item,
            SvnItem::List(vec![string("trunk"), SvnItem::List(Vec::new())])
        );

        let item = marshal("w?s", &[Slot::Word("EXTERNAL".into())]).unwrap();
        assert_eq!(item, SvnItem::List(vec![word("EXTERNAL")]));
    }

    #[test]
    fn marshal_rejects_missing_required() {
        let err = marshal("wn", &[Slot::Word("get-latest-rev".into())]).unwrap_err();
        assert!(matches!(err, SvnError::Protocol(_)));
    }

    #[test]
    fn malformed_templates() {
        assert!(Template::parse("(w").is_err());
        assert!(Template::parse("w)").is_err());
        assert!(Template::parse("*").is_err());
        assert!(Template::parse("*ww").is_err());
        assert!(Template::parse("w?s?n").is_err());
        assert!(Template::parse("x").is_err());
    }
}
