//! Canonical act codes.
//!
//! Every interpreted utterance is reduced to an [`ActCode`]: three hex
//! symbols drawn from a sixteen-token vocabulary of conversational verbs and
//! objects. The code is the dispatch key for flow construction, for the
//! unsupported-act denylist, and for developer overrides, and it renders to a
//! human-readable phrase such as `retrieve + update + row`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActToken {
    Chat,
    Query,
    Measure,
    Plot,
    Retrieve,
    Insert,
    Update,
    Delete,
    User,
    Agent,
    Table,
    Row,
    Column,
    Multiple,
    Confirm,
    Deny,
}

const TOKENS: [ActToken; 16] = [
    ActToken::Chat,
    ActToken::Query,
    ActToken::Measure,
    ActToken::Plot,
    ActToken::Retrieve,
    ActToken::Insert,
    ActToken::Update,
    ActToken::Delete,
    ActToken::User,
    ActToken::Agent,
    ActToken::Table,
    ActToken::Row,
    ActToken::Column,
    ActToken::Multiple,
    ActToken::Confirm,
    ActToken::Deny,
];

const SYMBOLS: &[u8; 16] = b"0123456789ABCDEF";

impl ActToken {
    pub fn symbol(self) -> u8 {
        SYMBOLS[self as usize]
    }

    pub fn from_symbol(symbol: u8) -> Option<Self> {
        let index = SYMBOLS.iter().position(|candidate| *candidate == symbol.to_ascii_uppercase())?;
        Some(TOKENS[index])
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Query => "query",
            Self::Measure => "measure",
            Self::Plot => "plot",
            Self::Retrieve => "retrieve",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::User => "user",
            Self::Agent => "agent",
            Self::Table => "table",
            Self::Row => "row",
            Self::Column => "column",
            Self::Multiple => "multiple",
            Self::Confirm => "confirm",
            Self::Deny => "deny",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        TOKENS.iter().copied().find(|token| token.as_str() == normalized)
    }
}

impl fmt::Display for ActToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Analyze,
    Visualize,
    Clean,
    Transform,
    Detect,
    Converse,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Visualize => "visualize",
            Self::Clean => "clean",
            Self::Transform => "transform",
            Self::Detect => "detect",
            Self::Converse => "converse",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Intent {
    type Err = ActCodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "analyze" => Ok(Self::Analyze),
            "visualize" => Ok(Self::Visualize),
            "clean" => Ok(Self::Clean),
            "transform" => Ok(Self::Transform),
            "detect" => Ok(Self::Detect),
            "converse" => Ok(Self::Converse),
            other => Err(ActCodeError::UnknownIntent(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ActCodeError {
    #[error("act code `{0}` must be exactly three hex symbols")]
    Malformed(String),
    #[error("unknown act token `{0}`")]
    UnknownToken(String),
    #[error("an act code holds at most three distinct tokens, got {0}")]
    TooManyTokens(usize),
    #[error("unknown intent `{0}`")]
    UnknownIntent(String),
}

/// Three-symbol categorical act code, stored as upper-case ASCII.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActCode([u8; 3]);

/// Acts the engine refuses to carry out from conversation.
pub const UNSUPPORTED_ACTS: [ActCode; 3] = [
    ActCode(*b"07A"), // delete + table
    ActCode(*b"7AD"), // delete + table + multiple
    ActCode(*b"58A"), // user + insert + table
];

const KNOWN_INTENTS: [(ActCode, Intent); 15] = [
    (ActCode(*b"000"), Intent::Converse),
    (ActCode(*b"001"), Intent::Analyze),
    (ActCode(*b"002"), Intent::Analyze),
    (ActCode(*b"01A"), Intent::Analyze),
    (ActCode(*b"01D"), Intent::Analyze),
    (ActCode(*b"003"), Intent::Visualize),
    (ActCode(*b"06B"), Intent::Clean),
    (ActCode(*b"7BD"), Intent::Clean),
    (ActCode(*b"05C"), Intent::Transform),
    (ActCode(*b"07C"), Intent::Transform),
    (ActCode(*b"5AD"), Intent::Transform),
    (ActCode(*b"69B"), Intent::Detect),
    (ActCode(*b"00E"), Intent::Converse),
    (ActCode(*b"00F"), Intent::Converse),
    (ActCode(*b"FFF"), Intent::Converse),
];

impl ActCode {
    pub const CHAT: ActCode = ActCode(*b"000");
    pub const QUERY: ActCode = ActCode(*b"001");
    pub const CONFIRM: ActCode = ActCode(*b"00E");
    pub const DENY: ActCode = ActCode(*b"00F");
    pub const UNSUPPORTED: ActCode = ActCode(*b"FFF");

    /// Unchecked constructor for static tables; symbols must be upper-case hex.
    pub(crate) const fn raw(symbols: [u8; 3]) -> Self {
        Self(symbols)
    }

    pub fn new(value: &str) -> Result<Self, ActCodeError> {
        let bytes = value.trim().as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_hexdigit) {
            return Err(ActCodeError::Malformed(value.to_string()));
        }
        let mut symbols = [0u8; 3];
        for (slot, byte) in symbols.iter_mut().zip(bytes) {
            *slot = byte.to_ascii_uppercase();
        }
        Ok(Self(symbols))
    }

    /// Builds the canonical code: symbols deduplicated, sorted, `chat`
    /// dropped when anything else is present, left-padded with `0`.
    pub fn from_tokens(tokens: &[ActToken]) -> Result<Self, ActCodeError> {
        let mut symbols = tokens.iter().map(|token| token.symbol()).collect::<Vec<_>>();
        symbols.sort_unstable();
        symbols.dedup();
        if symbols.len() > 1 {
            symbols.retain(|symbol| *symbol != b'0');
        }
        if symbols.len() > 3 {
            return Err(ActCodeError::TooManyTokens(symbols.len()));
        }

        let mut code = [b'0'; 3];
        let offset = 3 - symbols.len();
        code[offset..].copy_from_slice(&symbols);
        Ok(Self(code))
    }

    pub fn from_phrase(phrase: &str) -> Result<Self, ActCodeError> {
        let tokens = phrase
            .split('+')
            .map(|part| ActToken::parse(part).ok_or_else(|| ActCodeError::UnknownToken(part.trim().to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_tokens(&tokens)
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("FFF")
    }

    pub fn tokens(&self) -> Vec<ActToken> {
        let significant = self
            .0
            .iter()
            .skip_while(|symbol| **symbol == b'0')
            .filter_map(|symbol| ActToken::from_symbol(*symbol))
            .collect::<Vec<_>>();
        if significant.is_empty() {
            vec![ActToken::Chat]
        } else {
            significant
        }
    }

    pub fn contains(&self, token: ActToken) -> bool {
        self.0.contains(&token.symbol())
    }

    pub fn phrase(&self) -> String {
        self.tokens().iter().map(|token| token.as_str()).collect::<Vec<_>>().join(" + ")
    }

    pub fn intent(&self) -> Intent {
        if let Some((_, intent)) = KNOWN_INTENTS.iter().find(|(code, _)| code == self) {
            return *intent;
        }

        use ActToken::*;
        if self.contains(Plot) {
            Intent::Visualize
        } else if self.contains(Agent) {
            Intent::Detect
        } else if (self.contains(Update) || self.contains(Delete))
            && (self.contains(Row) || self.contains(Column))
        {
            Intent::Clean
        } else if self.contains(Insert) || self.contains(Table) {
            Intent::Transform
        } else if self.contains(Query) || self.contains(Measure) || self.contains(Retrieve) {
            Intent::Analyze
        } else {
            Intent::Converse
        }
    }

    pub fn is_unsupported(&self) -> bool {
        *self == Self::UNSUPPORTED || UNSUPPORTED_ACTS.contains(self)
    }

    /// Replaces denylisted codes with [`ActCode::UNSUPPORTED`].
    pub fn screened(self) -> Self {
        if self.is_unsupported() {
            Self::UNSUPPORTED
        } else {
            self
        }
    }
}

impl fmt::Debug for ActCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActCode({})", self.as_str())
    }
}

impl fmt::Display for ActCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActCode {
    type Err = ActCodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::new(value)
    }
}

impl TryFrom<String> for ActCode {
    type Error = ActCodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<ActCode> for String {
    fn from(value: ActCode) -> Self {
        value.as_str().to_string()
    }
}

/// Intent plus act rendered as `clean: update + row`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActPhrase {
    pub intent: Intent,
    pub act: ActCode,
}

impl ActPhrase {
    pub fn for_act(act: ActCode) -> Self {
        Self { intent: act.intent(), act }
    }
}

impl fmt::Display for ActPhrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.intent, self.act.phrase())
    }
}

impl FromStr for ActPhrase {
    type Err = ActCodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once(':') {
            Some((intent, phrase)) => {
                Ok(Self { intent: intent.parse()?, act: ActCode::from_phrase(phrase)? })
            }
            None => Ok(Self::for_act(ActCode::from_phrase(value)?)),
        }
    }
}
