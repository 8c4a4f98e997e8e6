//! The `expect` / `test` assertion library.
//!
//! Guest code calls `expect(value).toBe(other)`. The prelude snapshots both
//! values into [`GuestValue`] trees and hands them to [`evaluate`]. All
//! predicates, negation and failure formatting live here. The guest side
//! only throws the `AssertionError` whose message this module produced.
//!
//! Reference-typed guest values (objects, arrays, functions, symbols) carry an
//! identity id. Ids are assigned from one table for both sides of a single
//! assertion, so two snapshots with the same id are the same guest object.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::challenge::TestRecord;

/// Rendered values longer than this are truncated in failure messages.
const MAX_RENDERED_CHARS: usize = 160;

/// Structural snapshot of a guest value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GuestValue {
    /// `undefined`.
    Undefined,
    /// `null`.
    Null,
    /// A boolean primitive.
    Boolean {
        /// The value.
        value: bool,
    },
    /// A number primitive. Transported as a string so `NaN`, `Infinity` and
    /// `-0` survive JSON.
    Number {
        /// The value.
        #[serde(with = "js_number")]
        value: f64,
    },
    /// A bigint primitive, in decimal.
    #[serde(rename = "bigint")]
    BigInt {
        /// Decimal digits.
        value: String,
    },
    /// A string primitive.
    #[serde(rename = "string")]
    Text {
        /// The value.
        value: String,
    },
    /// A symbol.
    Symbol {
        /// Identity.
        id: u32,
        /// `symbol.description`.
        description: String,
    },
    /// A function or class.
    Function {
        /// Identity.
        id: u32,
        /// `fn.name`, empty for anonymous functions.
        name: String,
    },
    /// An array.
    Array {
        /// Identity.
        id: u32,
        /// Elements in order.
        items: Vec<GuestValue>,
    },
    /// Any other object. Maps and sets arrive here with class `Map` / `Set`.
    Object {
        /// Identity.
        id: u32,
        /// Constructor name, when not `Object`.
        #[serde(default)]
        class: Option<String>,
        /// Own enumerable properties.
        entries: Vec<(String, GuestValue)>,
    },
    /// An `Error` instance.
    Error {
        /// Identity.
        id: u32,
        /// `error.name`.
        name: String,
        /// `error.message`.
        message: String,
    },
    /// A `RegExp` instance.
    Regexp {
        /// Identity.
        id: u32,
        /// `re.source`.
        source: String,
        /// `re.flags`.
        flags: String,
    },
    /// A `Date` instance.
    Date {
        /// Identity.
        id: u32,
        /// Milliseconds since the epoch.
        #[serde(with = "js_number")]
        value: f64,
    },
    /// A back-reference to an ancestor (cycle) or a value past the depth limit.
    Ref {
        /// Identity of the referenced value.
        id: u32,
    },
    /// The outcome of calling the received function for `toThrow`.
    Thrown {
        /// What was thrown, or `None` when the call returned normally.
        #[serde(default)]
        error: Option<Box<GuestValue>>,
    },
}

impl GuestValue {
    /// Shorthand for a number value.
    pub fn number(value: f64) -> Self {
        Self::Number { value }
    }

    /// Shorthand for a string value.
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text {
            value: value.into(),
        }
    }

    /// Identity of reference-typed values.
    pub fn identity(&self) -> Option<u32> {
        match self {
            Self::Symbol { id, .. }
            | Self::Function { id, .. }
            | Self::Array { id, .. }
            | Self::Object { id, .. }
            | Self::Error { id, .. }
            | Self::Regexp { id, .. }
            | Self::Date { id, .. }
            | Self::Ref { id } => Some(*id),
            _ => None,
        }
    }

    /// JavaScript truthiness.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Boolean { value } => *value,
            Self::Number { value } => !(*value == 0.0 || value.is_nan()),
            Self::BigInt { value } => value != "0" && value != "-0",
            Self::Text { value } => !value.is_empty(),
            _ => true,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number { value } => Some(*value),
            _ => None,
        }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { value } => Some(value),
            _ => None,
        }
    }

    /// Own property lookup used by `toHaveProperty`.
    fn property(&self, key: &str) -> Option<GuestValue> {
        match self {
            Self::Object { entries, .. } => entries
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone()),
            Self::Array { items, .. } => {
                if key == "length" {
                    return Some(Self::number(items.len() as f64));
                }
                key.parse::<usize>().ok().and_then(|i| items.get(i).cloned())
            }
            Self::Text { value } if key == "length" => {
                Some(Self::number(value.encode_utf16().count() as f64))
            }
            Self::Error { name, message, .. } => match key {
                "name" => Some(Self::text(name.clone())),
                "message" => Some(Self::text(message.clone())),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for GuestValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Boolean { value } => write!(f, "{value}"),
            Self::Number { value } => f.write_str(&js_number::format(*value)),
            Self::BigInt { value } => write!(f, "{value}n"),
            Self::Text { value } => {
                let quoted = serde_json::to_string(value).map_err(|_| fmt::Error)?;
                f.write_str(&quoted)
            }
            Self::Symbol { description, .. } => write!(f, "Symbol({description})"),
            Self::Function { name, .. } if name.is_empty() => f.write_str("[Function anonymous]"),
            Self::Function { name, .. } => write!(f, "[Function {name}]"),
            Self::Array { items, .. } => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Object { class, entries, .. } => {
                if let Some(class) = class {
                    write!(f, "{class} ")?;
                }
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    let key = serde_json::to_string(key).map_err(|_| fmt::Error)?;
                    write!(f, "{key}: {value}")?;
                }
                f.write_str("}")
            }
            Self::Error { name, message, .. } => write!(f, "[{name}: {message}]"),
            Self::Regexp { source, flags, .. } => write!(f, "/{source}/{flags}"),
            Self::Date { value, .. } => write!(f, "Date({})", js_number::format(*value)),
            Self::Ref { .. } => f.write_str("[Circular]"),
            Self::Thrown { error: None } => f.write_str("[function did not throw]"),
            Self::Thrown { error: Some(e) } => write!(f, "[thrown {e}]"),
        }
    }
}

/// `Object.is` semantics.
pub fn same_value(a: &GuestValue, b: &GuestValue) -> bool {
    use GuestValue as V;
    match (a, b) {
        (V::Undefined, V::Undefined) | (V::Null, V::Null) => true,
        (V::Boolean { value: x }, V::Boolean { value: y }) => x == y,
        (V::Number { value: x }, V::Number { value: y }) => {
            (x.is_nan() && y.is_nan())
                || (x == y && (*x != 0.0 || x.is_sign_negative() == y.is_sign_negative()))
        }
        (V::BigInt { value: x }, V::BigInt { value: y }) => x == y,
        (V::Text { value: x }, V::Text { value: y }) => x == y,
        _ => match (a.identity(), b.identity()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

/// Recursive structural equality used by `toEqual`.
///
/// Primitives compare with `Object.is`. Arrays compare element-wise in order.
/// Objects compare by key set regardless of insertion order, skipping
/// properties whose value is `undefined`. Set members match one-to-one in any
/// order. Constructor names are otherwise ignored.
///
/// Cycles compare equal when both sides point back at the same ancestor
/// depth. Values cut off at the snapshot depth limit are equal on both sides
/// as far as they were captured.
pub fn deep_equal(a: &GuestValue, b: &GuestValue) -> bool {
    Comparison::default().equal(a, b)
}

/// Identity ids of the containers above the current pair, one stack per side.
#[derive(Default)]
struct Comparison {
    received: Vec<u32>,
    expected: Vec<u32>,
}

impl Comparison {
    fn equal(&mut self, a: &GuestValue, b: &GuestValue) -> bool {
        use GuestValue as V;
        if let (Some(x), Some(y)) = (a.identity(), b.identity()) {
            if x == y {
                return true;
            }
        }
        match (a, b) {
            // A ref that matches no ancestor is a depth cut-off.
            (V::Ref { id: x }, V::Ref { id: y }) => {
                self.received.iter().rposition(|id| id == x)
                    == self.expected.iter().rposition(|id| id == y)
            }
            (V::Array { id: ia, items: x }, V::Array { id: ib, items: y }) => {
                x.len() == y.len()
                    && self.descend(*ia, *ib, |c| x.iter().zip(y).all(|(l, r)| c.equal(l, r)))
            }
            (
                V::Object {
                    id: ia,
                    class: ca,
                    entries: x,
                },
                V::Object {
                    id: ib,
                    class: cb,
                    entries: y,
                },
            ) => {
                let is_set = |class: &Option<String>| class.as_deref() == Some("Set");
                match (is_set(ca), is_set(cb)) {
                    (true, true) => self.descend(*ia, *ib, |c| c.members(x, y)),
                    (false, false) => self.descend(*ia, *ib, |c| c.properties(x, y)),
                    _ => false,
                }
            }
            (V::Error { message: x, .. }, V::Error { message: y, .. }) => x == y,
            (
                V::Regexp {
                    source: s1,
                    flags: f1,
                    ..
                },
                V::Regexp {
                    source: s2,
                    flags: f2,
                    ..
                },
            ) => s1 == s2 && f1 == f2,
            (V::Date { value: x, .. }, V::Date { value: y, .. }) => {
                same_value(&V::number(*x), &V::number(*y))
            }
            (V::Thrown { error: None }, V::Thrown { error: None }) => true,
            _ => same_value(a, b),
        }
    }

    fn descend(&mut self, a: u32, b: u32, compare: impl FnOnce(&mut Self) -> bool) -> bool {
        self.received.push(a);
        self.expected.push(b);
        let equal = compare(self);
        self.received.pop();
        self.expected.pop();
        equal
    }

    fn properties(&mut self, x: &[(String, GuestValue)], y: &[(String, GuestValue)]) -> bool {
        let defined = |entries: &[(String, GuestValue)]| {
            entries
                .iter()
                .filter(|(_, v)| !matches!(v, GuestValue::Undefined))
                .count()
        };
        if defined(x) != defined(y) {
            return false;
        }
        x.iter()
            .filter(|(_, v)| !matches!(v, GuestValue::Undefined))
            .all(|(key, l)| {
                y.iter()
                    .find(|(k, _)| k == key)
                    .is_some_and(|(_, r)| self.equal(l, r))
            })
    }

    fn members(&mut self, x: &[(String, GuestValue)], y: &[(String, GuestValue)]) -> bool {
        if x.len() != y.len() {
            return false;
        }
        let mut used = vec![false; y.len()];
        'members: for (_, l) in x {
            for (i, (_, r)) in y.iter().enumerate() {
                if !used[i] && self.equal(l, r) {
                    used[i] = true;
                    continue 'members;
                }
            }
            return false;
        }
        true
    }
}

/// The matchers an [`Expectation`] exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Matcher {
    /// `Object.is` identity.
    ToBe,
    /// Deep structural equality.
    ToEqual,
    /// JavaScript truthiness.
    ToBeTruthy,
    /// JavaScript falsiness.
    ToBeFalsy,
    /// `=== null`.
    ToBeNull,
    /// `=== undefined`.
    ToBeUndefined,
    /// `!== undefined`.
    ToBeDefined,
    /// `Number.isNaN`.
    ToBeNaN,
    /// `received > expected`.
    ToBeGreaterThan,
    /// `received >= expected`.
    ToBeGreaterThanOrEqual,
    /// `received < expected`.
    ToBeLessThan,
    /// `received <= expected`.
    ToBeLessThanOrEqual,
    /// Substring or array element by identity.
    ToContain,
    /// Array element by deep equality.
    ToContainEqual,
    /// `.length === expected`.
    ToHaveLength,
    /// Property path exists, optionally with a deep-equal value.
    ToHaveProperty,
    /// Substring or regular expression match.
    ToMatch,
    /// Calling the received function throws.
    ToThrow,
}

impl Matcher {
    /// Every matcher, in the order the prelude installs them.
    pub const ALL: &'static [Matcher] = &[
        Self::ToBe,
        Self::ToEqual,
        Self::ToBeTruthy,
        Self::ToBeFalsy,
        Self::ToBeNull,
        Self::ToBeUndefined,
        Self::ToBeDefined,
        Self::ToBeNaN,
        Self::ToBeGreaterThan,
        Self::ToBeGreaterThanOrEqual,
        Self::ToBeLessThan,
        Self::ToBeLessThanOrEqual,
        Self::ToContain,
        Self::ToContainEqual,
        Self::ToHaveLength,
        Self::ToHaveProperty,
        Self::ToMatch,
        Self::ToThrow,
    ];

    /// The guest-visible method name.
    pub fn name(self) -> &'static str {
        match self {
            Self::ToBe => "toBe",
            Self::ToEqual => "toEqual",
            Self::ToBeTruthy => "toBeTruthy",
            Self::ToBeFalsy => "toBeFalsy",
            Self::ToBeNull => "toBeNull",
            Self::ToBeUndefined => "toBeUndefined",
            Self::ToBeDefined => "toBeDefined",
            Self::ToBeNaN => "toBeNaN",
            Self::ToBeGreaterThan => "toBeGreaterThan",
            Self::ToBeGreaterThanOrEqual => "toBeGreaterThanOrEqual",
            Self::ToBeLessThan => "toBeLessThan",
            Self::ToBeLessThanOrEqual => "toBeLessThanOrEqual",
            Self::ToContain => "toContain",
            Self::ToContainEqual => "toContainEqual",
            Self::ToHaveLength => "toHaveLength",
            Self::ToHaveProperty => "toHaveProperty",
            Self::ToMatch => "toMatch",
            Self::ToThrow => "toThrow",
        }
    }

    /// Whether the matcher compares against an argument.
    pub fn takes_expected(self) -> bool {
        !matches!(
            self,
            Self::ToBeTruthy
                | Self::ToBeFalsy
                | Self::ToBeNull
                | Self::ToBeUndefined
                | Self::ToBeDefined
                | Self::ToBeNaN
        )
    }
}

impl FromStr for Matcher {
    type Err = AssertionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.name() == s)
            .ok_or_else(|| AssertionError::new(format!("expect(...).{s} is not a function")))
    }
}

/// A failed assertion. The message is shown to the learner verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct AssertionError {
    message: String,
}

impl AssertionError {
    /// Create an assertion error with a preformatted message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The formatted failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A received value plus the negation flag that `.not` toggles.
#[derive(Debug, Clone, PartialEq)]
pub struct Expectation {
    received: GuestValue,
    negated: bool,
}

impl Expectation {
    /// `expect(received)`.
    pub fn new(received: GuestValue) -> Self {
        Self {
            received,
            negated: false,
        }
    }

    /// `.not`: the same expectation with every outcome inverted.
    pub fn not(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    /// Whether this is a `.not` view.
    pub fn is_negated(&self) -> bool {
        self.negated
    }

    /// Run `matcher` against `expected` (ignored by unary matchers).
    ///
    /// The predicate is evaluated once; the negation flag decides whether a
    /// true predicate passes or fails. Misuse (e.g. comparing a string with
    /// `toBeGreaterThan`) fails whether or not the expectation is negated.
    pub fn check(&self, matcher: Matcher, expected: &GuestValue) -> Result<(), AssertionError> {
        let pass = self.predicate(matcher, expected)?;
        if pass != self.negated {
            Ok(())
        } else {
            Err(self.failure(matcher, expected))
        }
    }

    /// `toBe(expected)`.
    pub fn to_be(&self, expected: &GuestValue) -> Result<(), AssertionError> {
        self.check(Matcher::ToBe, expected)
    }

    /// `toEqual(expected)`.
    pub fn to_equal(&self, expected: &GuestValue) -> Result<(), AssertionError> {
        self.check(Matcher::ToEqual, expected)
    }

    /// `toBeTruthy()`.
    pub fn to_be_truthy(&self) -> Result<(), AssertionError> {
        self.check(Matcher::ToBeTruthy, &GuestValue::Undefined)
    }

    /// `toBeGreaterThan(expected)`.
    pub fn to_be_greater_than(&self, expected: &GuestValue) -> Result<(), AssertionError> {
        self.check(Matcher::ToBeGreaterThan, expected)
    }

    /// `toContain(expected)`.
    pub fn to_contain(&self, expected: &GuestValue) -> Result<(), AssertionError> {
        self.check(Matcher::ToContain, expected)
    }

    fn predicate(&self, matcher: Matcher, expected: &GuestValue) -> Result<bool, AssertionError> {
        use GuestValue as V;
        let received = &self.received;
        let pass = match matcher {
            Matcher::ToBe => same_value(received, expected),
            Matcher::ToEqual => deep_equal(received, expected),
            Matcher::ToBeTruthy => received.is_truthy(),
            Matcher::ToBeFalsy => !received.is_truthy(),
            Matcher::ToBeNull => matches!(received, V::Null),
            Matcher::ToBeUndefined => matches!(received, V::Undefined),
            Matcher::ToBeDefined => !matches!(received, V::Undefined),
            Matcher::ToBeNaN => received.as_number().is_some_and(f64::is_nan),
            Matcher::ToBeGreaterThan
            | Matcher::ToBeGreaterThanOrEqual
            | Matcher::ToBeLessThan
            | Matcher::ToBeLessThanOrEqual => {
                let (Some(r), Some(e)) = (received.as_number(), expected.as_number()) else {
                    return Err(self.misuse(
                        matcher,
                        expected,
                        "received and expected values must be numbers",
                    ));
                };
                match matcher {
                    Matcher::ToBeGreaterThan => r > e,
                    Matcher::ToBeGreaterThanOrEqual => r >= e,
                    Matcher::ToBeLessThan => r < e,
                    _ => r <= e,
                }
            }
            Matcher::ToContain => match received {
                V::Text { value } => match expected.as_text() {
                    Some(needle) => value.contains(needle),
                    None => {
                        return Err(self.misuse(
                            matcher,
                            expected,
                            "expected value must be a string when received value is a string",
                        ))
                    }
                },
                V::Array { items, .. } => items.iter().any(|item| same_value(item, expected)),
                V::Object {
                    class: Some(class),
                    entries,
                    ..
                } if class == "Set" => entries.iter().any(|(_, v)| same_value(v, expected)),
                _ => {
                    return Err(self.misuse(
                        matcher,
                        expected,
                        "received value must be a string, an array or a set",
                    ))
                }
            },
            Matcher::ToContainEqual => match received {
                V::Array { items, .. } => items.iter().any(|item| deep_equal(item, expected)),
                _ => {
                    return Err(self.misuse(matcher, expected, "received value must be an array"))
                }
            },
            Matcher::ToHaveLength => {
                let Some(want) = expected.as_number().filter(|n| *n >= 0.0 && n.fract() == 0.0)
                else {
                    return Err(self.misuse(
                        matcher,
                        expected,
                        "expected value must be a non-negative integer",
                    ));
                };
                let Some(have) = received.property("length").and_then(|l| l.as_number()) else {
                    return Err(self.misuse(
                        matcher,
                        expected,
                        "received value must have a length property whose value is a number",
                    ));
                };
                have == want
            }
            Matcher::ToHaveProperty => self.has_property(expected)?,
            Matcher::ToMatch => {
                let Some(haystack) = received.as_text() else {
                    return Err(self.misuse(matcher, expected, "received value must be a string"));
                };
                match expected {
                    V::Text { value } => haystack.contains(value.as_str()),
                    V::Regexp { source, flags, .. } => compile_regexp(source, flags)
                        .map_err(|reason| self.misuse(matcher, expected, &reason))?
                        .is_match(haystack),
                    _ => {
                        return Err(self.misuse(
                            matcher,
                            expected,
                            "expected value must be a string or a regular expression",
                        ))
                    }
                }
            }
            Matcher::ToThrow => {
                let V::Thrown { error } = received else {
                    return Err(self.misuse(matcher, expected, "received value must be a function"));
                };
                match error.as_deref() {
                    None => false,
                    Some(thrown) => thrown_matches(thrown, expected)
                        .map_err(|reason| self.misuse(matcher, expected, &reason))?,
                }
            }
        };
        Ok(pass)
    }

    fn has_property(&self, expected: &GuestValue) -> Result<bool, AssertionError> {
        use GuestValue as V;
        let matcher = Matcher::ToHaveProperty;
        let V::Array { items: args, .. } = expected else {
            return Err(self.misuse(matcher, expected, "expected a property path"));
        };
        let path: Vec<String> = match args.first() {
            Some(V::Text { value }) => value.split('.').map(str::to_string).collect(),
            Some(V::Array { items, .. }) => items
                .iter()
                .map(|segment| match segment {
                    V::Text { value } => Some(value.clone()),
                    V::Number { value } => Some(js_number::format(*value)),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| {
                    self.misuse(matcher, expected, "path segments must be strings or numbers")
                })?,
            _ => {
                return Err(self.misuse(
                    matcher,
                    expected,
                    "expected path must be a string or an array",
                ))
            }
        };
        if matches!(self.received, V::Undefined | V::Null) {
            return Err(self.misuse(
                matcher,
                expected,
                "received value must not be null nor undefined",
            ));
        }

        let mut current = self.received.clone();
        for segment in &path {
            match current.property(segment) {
                Some(next) => current = next,
                None => return Ok(false),
            }
        }
        Ok(match args.get(1) {
            Some(value) => deep_equal(&current, value),
            None => true,
        })
    }

    fn header(&self, matcher: Matcher) -> String {
        let not = if self.negated { ".not" } else { "" };
        let arg = if matcher.takes_expected() {
            "expected"
        } else {
            ""
        };
        format!("expect(received){not}.{}({arg})", matcher.name())
    }

    fn failure(&self, matcher: Matcher, expected: &GuestValue) -> AssertionError {
        let received = render(&self.received);
        let message = if matcher.takes_expected() {
            let not = if self.negated { "not " } else { "" };
            format!(
                "{}\n\nExpected: {not}{}\nReceived: {received}",
                self.header(matcher),
                render(expected)
            )
        } else {
            format!("{}\n\nReceived: {received}", self.header(matcher))
        };
        AssertionError::new(message)
    }

    fn misuse(&self, matcher: Matcher, expected: &GuestValue, reason: &str) -> AssertionError {
        let mut message = format!("{}\n\nMatcher error: {reason}\n", self.header(matcher));
        if matcher.takes_expected() {
            message.push_str(&format!("Expected: {}\n", render(expected)));
        }
        message.push_str(&format!("Received: {}", render(&self.received)));
        AssertionError::new(message)
    }
}

fn thrown_matches(thrown: &GuestValue, expected: &GuestValue) -> Result<bool, String> {
    use GuestValue as V;
    let (name, message) = match thrown {
        V::Error { name, message, .. } => (name.clone(), message.clone()),
        V::Text { value } => (String::new(), value.clone()),
        other => (String::new(), other.to_string()),
    };
    match expected {
        V::Undefined => Ok(true),
        V::Text { value } => Ok(message.contains(value.as_str())),
        V::Regexp { source, flags, .. } => Ok(compile_regexp(source, flags)?.is_match(&message)),
        V::Error {
            message: wanted, ..
        } => Ok(&message == wanted),
        V::Function { name: class, .. } => Ok(class == "Error" || *class == name),
        _ => Err("expected value must be a string, a regular expression, an error or a class".into()),
    }
}

/// Translate a guest regular expression into a [`regex::Regex`].
///
/// Supports the `i`, `m` and `s` flags; `g`, `y`, `u` and `d` do not change
/// whether a pattern matches and are ignored.
fn compile_regexp(source: &str, flags: &str) -> Result<regex::Regex, String> {
    regex::RegexBuilder::new(source)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .build()
        .map_err(|e| format!("unsupported regular expression /{source}/{flags}: {e}"))
}

/// Render a value for a failure message, truncating long output.
pub fn render(value: &GuestValue) -> String {
    truncate(&value.to_string(), MAX_RENDERED_CHARS)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

/// Evaluate one guest assertion from its JSON snapshots.
///
/// This is the entry point the `op_pairwise_expect` op calls.
pub fn evaluate(
    matcher: &str,
    received: &str,
    expected: &str,
    negated: bool,
) -> Result<(), AssertionError> {
    let matcher: Matcher = matcher.parse()?;
    let received: GuestValue = serde_json::from_str(received)
        .map_err(|e| AssertionError::new(format!("invalid received value snapshot: {e}")))?;
    let expected: GuestValue = serde_json::from_str(expected)
        .map_err(|e| AssertionError::new(format!("invalid expected value snapshot: {e}")))?;
    let mut expectation = Expectation::new(received);
    if negated {
        expectation = expectation.not();
    }
    expectation.check(matcher, &expected)
}

/// Ordered record of `test(...)` calls within one run.
///
/// Slots are allocated when a test starts, so async tests that settle out of
/// order still report in registration order.
#[derive(Debug, Default)]
pub struct TestLedger {
    slots: Vec<LedgerSlot>,
}

#[derive(Debug)]
struct LedgerSlot {
    message: String,
    outcome: Option<Result<(), String>>,
}

impl TestLedger {
    /// Register a test and return its slot.
    pub fn begin(&mut self, message: impl Into<String>) -> usize {
        self.slots.push(LedgerSlot {
            message: message.into(),
            outcome: None,
        });
        self.slots.len() - 1
    }

    /// Record the outcome of a test. Returns false for an unknown or
    /// already-settled slot, which is left untouched.
    pub fn finish(&mut self, slot: usize, outcome: Result<(), String>) -> bool {
        match self.slots.get_mut(slot) {
            Some(entry) if entry.outcome.is_none() => {
                entry.outcome = Some(outcome);
                true
            }
            _ => false,
        }
    }

    /// Number of registered tests.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no test has been registered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Final records. Tests that never settled count as failures.
    pub fn into_records(self) -> Vec<TestRecord> {
        self.slots
            .into_iter()
            .map(|slot| match slot.outcome {
                Some(Ok(())) => TestRecord {
                    message: slot.message,
                    passed: true,
                    error: None,
                },
                Some(Err(error)) => TestRecord {
                    message: slot.message,
                    passed: false,
                    error: Some(error),
                },
                None => TestRecord {
                    message: slot.message,
                    passed: false,
                    error: Some("test did not complete".into()),
                },
            })
            .collect()
    }
}

/// JavaScript number <-> string, preserving `NaN`, `Infinity` and `-0`.
mod js_number {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(value: f64) -> String {
        if value.is_nan() {
            "NaN".into()
        } else if value.is_infinite() {
            if value > 0.0 { "Infinity" } else { "-Infinity" }.into()
        } else if value == 0.0 && value.is_sign_negative() {
            "-0".into()
        } else if value.fract() == 0.0 && value.abs() < 1e15 {
            format!("{value:.0}")
        } else {
            format!("{value}")
        }
    }

    pub fn parse(raw: &str) -> Option<f64> {
        match raw {
            "NaN" => Some(f64::NAN),
            "Infinity" => Some(f64::INFINITY),
            "-Infinity" => Some(f64::NEG_INFINITY),
            other => other.parse().ok(),
        }
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid number `{raw}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(id: u32, entries: &[(&str, GuestValue)]) -> GuestValue {
        GuestValue::Object {
            id,
            class: None,
            entries: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    fn arr(id: u32, items: Vec<GuestValue>) -> GuestValue {
        GuestValue::Array { id, items }
    }

    fn num(n: f64) -> GuestValue {
        GuestValue::number(n)
    }

    fn primitives() -> Vec<GuestValue> {
        vec![
            GuestValue::Undefined,
            GuestValue::Null,
            GuestValue::Boolean { value: true },
            GuestValue::Boolean { value: false },
            num(0.0),
            num(-0.0),
            num(42.5),
            num(f64::NAN),
            num(f64::INFINITY),
            GuestValue::text(""),
            GuestValue::text("pairwise"),
            GuestValue::BigInt {
                value: "12".into(),
            },
        ]
    }

    #[test]
    fn to_be_is_reflexive_on_primitives() {
        for value in primitives() {
            assert!(
                Expectation::new(value.clone()).to_be(&value).is_ok(),
                "{value} should be itself"
            );
        }
    }

    #[test]
    fn to_be_fails_for_distinct_primitives() {
        let values = primitives();
        for (i, a) in values.iter().enumerate() {
            for (j, b) in values.iter().enumerate() {
                if i != j {
                    assert!(
                        Expectation::new(a.clone()).to_be(b).is_err(),
                        "{a} should not be {b}"
                    );
                }
            }
        }
    }

    #[test]
    fn to_equal_passes_for_distinct_but_equal_objects() {
        let a = obj(1, &[("x", num(1.0)), ("y", arr(2, vec![num(2.0)]))]);
        let b = obj(3, &[("y", arr(4, vec![num(2.0)])), ("x", num(1.0))]);
        assert!(Expectation::new(a.clone()).to_equal(&b).is_ok());
        assert!(Expectation::new(a).to_be(&b).is_err());
    }

    #[test]
    fn to_be_passes_for_same_reference() {
        let a = obj(7, &[("x", num(1.0))]);
        let alias = GuestValue::Ref { id: 7 };
        assert!(Expectation::new(a).to_be(&alias).is_ok());
    }

    #[test]
    fn to_equal_is_order_sensitive_for_arrays() {
        let a = arr(1, vec![num(1.0), num(2.0)]);
        let b = arr(2, vec![num(2.0), num(1.0)]);
        assert!(Expectation::new(a).to_equal(&b).is_err());
    }

    #[test]
    fn to_equal_ignores_undefined_properties() {
        let a = obj(1, &[("x", num(1.0)), ("y", GuestValue::Undefined)]);
        let b = obj(2, &[("x", num(1.0))]);
        assert!(Expectation::new(a).to_equal(&b).is_ok());
    }

    #[test]
    fn to_equal_detects_missing_keys() {
        let a = obj(1, &[("x", num(1.0))]);
        let b = obj(2, &[("x", num(1.0)), ("z", num(0.0))]);
        assert!(Expectation::new(a.clone()).to_equal(&b).is_err());
        assert!(Expectation::new(b).to_equal(&a).is_err());
    }

    #[test]
    fn not_inverts_every_outcome() {
        let cases: Vec<(Matcher, GuestValue, GuestValue)> = vec![
            (Matcher::ToBe, num(1.0), num(1.0)),
            (Matcher::ToBe, num(1.0), num(2.0)),
            (Matcher::ToEqual, arr(1, vec![num(1.0)]), arr(2, vec![num(1.0)])),
            (Matcher::ToBeTruthy, GuestValue::text("x"), GuestValue::Undefined),
            (Matcher::ToBeFalsy, GuestValue::text("x"), GuestValue::Undefined),
            (Matcher::ToBeGreaterThan, num(3.0), num(2.0)),
            (Matcher::ToBeLessThanOrEqual, num(3.0), num(2.0)),
            (Matcher::ToContain, GuestValue::text("hello"), GuestValue::text("ell")),
            (Matcher::ToMatch, GuestValue::text("hello"), GuestValue::text("xyz")),
        ];
        for (matcher, received, expected) in cases {
            let plain = Expectation::new(received.clone()).check(matcher, &expected);
            let negated = Expectation::new(received).not().check(matcher, &expected);
            assert_ne!(
                plain.is_ok(),
                negated.is_ok(),
                "{} should invert under .not",
                matcher.name()
            );
        }
    }

    #[test]
    fn double_not_restores_expectation() {
        let e = Expectation::new(num(1.0)).not().not();
        assert!(!e.is_negated());
        assert!(e.to_be(&num(1.0)).is_ok());
    }

    #[test]
    fn misuse_fails_even_when_negated() {
        let e = Expectation::new(GuestValue::text("3")).not();
        let err = e.to_be_greater_than(&num(1.0)).unwrap_err();
        assert!(err.message().contains("Matcher error"), "{err}");
    }

    #[test]
    fn failure_message_is_diff_style() {
        let err = Expectation::new(num(2.0)).to_be(&num(3.0)).unwrap_err();
        assert_eq!(
            err.message(),
            "expect(received).toBe(expected)\n\nExpected: 3\nReceived: 2"
        );

        let err = Expectation::new(num(3.0))
            .not()
            .to_be(&num(3.0))
            .unwrap_err();
        assert!(err.message().starts_with("expect(received).not.toBe(expected)"));
        assert!(err.message().contains("Expected: not 3"));
    }

    #[test]
    fn long_values_are_truncated() {
        let long = GuestValue::text("a".repeat(500));
        let err = Expectation::new(long).to_be(&num(1.0)).unwrap_err();
        let received_line = err.message().lines().last().unwrap();
        assert!(received_line.ends_with('…'));
        assert!(received_line.chars().count() < 200);
    }

    #[test]
    fn to_contain_handles_strings_and_arrays() {
        let items = arr(1, vec![num(1.0), GuestValue::text("b")]);
        assert!(Expectation::new(items.clone())
            .to_contain(&GuestValue::text("b"))
            .is_ok());
        assert!(Expectation::new(items).to_contain(&num(2.0)).is_err());

        // toContain uses identity, so a structurally equal object is not found.
        let nested = arr(2, vec![obj(3, &[("a", num(1.0))])]);
        let needle = obj(4, &[("a", num(1.0))]);
        assert!(Expectation::new(nested.clone()).to_contain(&needle).is_err());
        assert!(Expectation::new(nested)
            .check(Matcher::ToContainEqual, &needle)
            .is_ok());
    }

    #[test]
    fn to_have_length_counts_utf16_units() {
        let e = Expectation::new(GuestValue::text("😀"));
        assert!(e.check(Matcher::ToHaveLength, &num(2.0)).is_ok());
        let e = Expectation::new(arr(1, vec![num(1.0); 3]));
        assert!(e.check(Matcher::ToHaveLength, &num(3.0)).is_ok());
        assert!(e.check(Matcher::ToHaveLength, &num(-1.0)).is_err());
    }

    #[test]
    fn to_have_property_walks_paths() {
        let value = obj(
            1,
            &[("user", obj(2, &[("tags", arr(3, vec![GuestValue::text("a")]))]))],
        );
        let e = Expectation::new(value);
        let path_only = arr(10, vec![GuestValue::text("user.tags.0")]);
        assert!(e.check(Matcher::ToHaveProperty, &path_only).is_ok());

        let with_value = arr(11, vec![GuestValue::text("user.tags.length"), num(1.0)]);
        assert!(e.check(Matcher::ToHaveProperty, &with_value).is_ok());

        let missing = arr(12, vec![GuestValue::text("user.name")]);
        assert!(e.check(Matcher::ToHaveProperty, &missing).is_err());
    }

    #[test]
    fn to_match_supports_regexp_flags() {
        let e = Expectation::new(GuestValue::text("Hello\nWorld"));
        let re = GuestValue::Regexp {
            id: 1,
            source: "^world$".into(),
            flags: "im".into(),
        };
        assert!(e.check(Matcher::ToMatch, &re).is_ok());

        let strict = GuestValue::Regexp {
            id: 2,
            source: "^world$".into(),
            flags: "".into(),
        };
        assert!(e.check(Matcher::ToMatch, &strict).is_err());
    }

    #[test]
    fn to_throw_inspects_the_thrown_value() {
        let thrown = GuestValue::Thrown {
            error: Some(Box::new(GuestValue::Error {
                id: 1,
                name: "RangeError".into(),
                message: "too big".into(),
            })),
        };
        let e = Expectation::new(thrown);
        assert!(e.check(Matcher::ToThrow, &GuestValue::Undefined).is_ok());
        assert!(e.check(Matcher::ToThrow, &GuestValue::text("big")).is_ok());
        assert!(e.check(Matcher::ToThrow, &GuestValue::text("small")).is_err());
        let class = GuestValue::Function {
            id: 9,
            name: "RangeError".into(),
        };
        assert!(e.check(Matcher::ToThrow, &class).is_ok());

        let quiet = Expectation::new(GuestValue::Thrown { error: None });
        assert!(quiet.check(Matcher::ToThrow, &GuestValue::Undefined).is_err());
        assert!(quiet
            .not()
            .check(Matcher::ToThrow, &GuestValue::Undefined)
            .is_ok());
    }

    #[test]
    fn to_throw_requires_a_function() {
        let err = Expectation::new(num(1.0))
            .check(Matcher::ToThrow, &GuestValue::Undefined)
            .unwrap_err();
        assert!(err.message().contains("must be a function"));
    }

    #[test]
    fn evaluate_parses_guest_snapshots() {
        let received = json!({"type": "number", "value": "NaN"}).to_string();
        let expected = json!({"type": "number", "value": "NaN"}).to_string();
        assert!(evaluate("toBe", &received, &expected, false).is_ok());

        let zero = json!({"type": "number", "value": "0"}).to_string();
        let negative_zero = json!({"type": "number", "value": "-0"}).to_string();
        assert!(evaluate("toBe", &zero, &negative_zero, false).is_err());
    }

    #[test]
    fn evaluate_rejects_unknown_matchers() {
        let v = json!({"type": "null"}).to_string();
        let err = evaluate("toBeAwesome", &v, &v, false).unwrap_err();
        assert!(err.message().contains("is not a function"));
    }

    #[test]
    fn to_equal_matches_cycles_at_the_same_depth() {
        let received = json!({"type": "object", "id": 0, "entries": [["self", {"type": "ref", "id": 0}]]});
        let expected = json!({"type": "object", "id": 1, "entries": [["self", {"type": "ref", "id": 1}]]});
        assert!(evaluate("toEqual", &received.to_string(), &expected.to_string(), false).is_ok());

        // {self: a} against {inner: {self: b}} loops back at different depths.
        let a = obj(0, &[("next", GuestValue::Ref { id: 0 })]);
        let b = obj(1, &[("next", obj(2, &[("next", GuestValue::Ref { id: 1 })]))]);
        assert!(Expectation::new(a).to_equal(&b).is_err());
    }

    #[test]
    fn to_equal_treats_matching_depth_cutoffs_as_equal() {
        let a = obj(0, &[("deep", GuestValue::Ref { id: 5 })]);
        let b = obj(1, &[("deep", GuestValue::Ref { id: 9 })]);
        assert!(Expectation::new(a).to_equal(&b).is_ok());
    }

    #[test]
    fn to_equal_ignores_set_insertion_order() {
        let set = |id: u32, members: &[f64]| GuestValue::Object {
            id,
            class: Some("Set".into()),
            entries: members
                .iter()
                .enumerate()
                .map(|(i, n)| (i.to_string(), num(*n)))
                .collect(),
        };
        assert!(Expectation::new(set(0, &[1.0, 2.0])).to_equal(&set(1, &[2.0, 1.0])).is_ok());
        assert!(Expectation::new(set(0, &[1.0, 1.0])).to_equal(&set(1, &[1.0, 2.0])).is_err());
        assert!(Expectation::new(set(0, &[1.0])).to_equal(&set(1, &[1.0, 2.0])).is_err());

        // A set never equals a plain object with index keys.
        let plain = obj(2, &[("0", num(1.0))]);
        assert!(Expectation::new(set(0, &[1.0])).to_equal(&plain).is_err());
    }

    #[test]
    fn snapshot_deserializes_nested_objects() {
        let raw = json!({
            "type": "object",
            "id": 0,
            "entries": [
                ["list", {"type": "array", "id": 1, "items": [{"type": "string", "value": "a"}]}],
                ["self", {"type": "ref", "id": 0}]
            ]
        });
        let value: GuestValue = serde_json::from_value(raw).unwrap();
        assert_eq!(value.to_string(), r#"{"list": ["a"], "self": [Circular]}"#);
    }

    #[test]
    fn ledger_keeps_registration_order() {
        let mut ledger = TestLedger::default();
        let first = ledger.begin("first");
        let second = ledger.begin("second");
        let third = ledger.begin("third");
        assert!(ledger.finish(second, Ok(())));
        assert!(ledger.finish(first, Err("AssertionError: nope".into())));
        assert!(!ledger.finish(first, Ok(())), "slots settle once");
        assert!(!ledger.finish(99, Ok(())));
        let _ = third;

        let records = ledger.into_records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].message, "first");
        assert!(!records[0].passed);
        assert!(records[1].passed);
        assert_eq!(records[2].error.as_deref(), Some("test did not complete"));
    }
}
