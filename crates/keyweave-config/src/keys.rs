//! Key vocabulary: input keys, output keys, modifiers and qualified keys.
//!
//! Input keys are the physical keys and pointer buttons the operator uses to
//! invoke gestures. Output keys are what the engine may synthesize toward the
//! OS. A [`QualifiedKey`] pairs an output key with a modifier set and has the
//! external form `"MOD+MOD+BASE"` (uppercase, modifier order irrelevant).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A physical key or pointer button whose press patterns the engine
/// classifies into gestures. Identity only; no attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InputKey {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "2")]
    Two,
    #[serde(rename = "3")]
    Three,
    #[serde(rename = "4")]
    Four,
    #[serde(rename = "5")]
    Five,
    #[serde(rename = "Q")]
    Q,
    #[serde(rename = "W")]
    W,
    #[serde(rename = "E")]
    E,
    #[serde(rename = "R")]
    R,
    #[serde(rename = "T")]
    T,
    #[serde(rename = "Z")]
    Z,
    #[serde(rename = "X")]
    X,
    #[serde(rename = "C")]
    C,
    #[serde(rename = "V")]
    V,
    #[serde(rename = "NUMPAD4")]
    Numpad4,
    #[serde(rename = "NUMPAD5")]
    Numpad5,
    #[serde(rename = "NUMPAD6")]
    Numpad6,
    #[serde(rename = "NUMPAD8")]
    Numpad8,
    #[serde(rename = "F13")]
    F13,
    #[serde(rename = "F14")]
    F14,
    #[serde(rename = "MIDDLE_CLICK")]
    MiddleClick,
    #[serde(rename = "MOUSE4")]
    Mouse4,
    #[serde(rename = "MOUSE5")]
    Mouse5,
}

impl InputKey {
    /// All input keys, in declaration order.
    pub const ALL: [InputKey; 23] = [
        InputKey::One,
        InputKey::Two,
        InputKey::Three,
        InputKey::Four,
        InputKey::Five,
        InputKey::Q,
        InputKey::W,
        InputKey::E,
        InputKey::R,
        InputKey::T,
        InputKey::Z,
        InputKey::X,
        InputKey::C,
        InputKey::V,
        InputKey::Numpad4,
        InputKey::Numpad5,
        InputKey::Numpad6,
        InputKey::Numpad8,
        InputKey::F13,
        InputKey::F14,
        InputKey::MiddleClick,
        InputKey::Mouse4,
        InputKey::Mouse5,
    ];

    /// Canonical uppercase name, as it appears in profiles and hook events.
    pub fn name(self) -> &'static str {
        match self {
            InputKey::One => "1",
            InputKey::Two => "2",
            InputKey::Three => "3",
            InputKey::Four => "4",
            InputKey::Five => "5",
            InputKey::Q => "Q",
            InputKey::W => "W",
            InputKey::E => "E",
            InputKey::R => "R",
            InputKey::T => "T",
            InputKey::Z => "Z",
            InputKey::X => "X",
            InputKey::C => "C",
            InputKey::V => "V",
            InputKey::Numpad4 => "NUMPAD4",
            InputKey::Numpad5 => "NUMPAD5",
            InputKey::Numpad6 => "NUMPAD6",
            InputKey::Numpad8 => "NUMPAD8",
            InputKey::F13 => "F13",
            InputKey::F14 => "F14",
            InputKey::MiddleClick => "MIDDLE_CLICK",
            InputKey::Mouse4 => "MOUSE4",
            InputKey::Mouse5 => "MOUSE5",
        }
    }

    /// Look up an input key by its canonical name. Names must already be
    /// canonicalized (see [`canonicalize_key_name`]).
    pub fn from_name(name: &str) -> Option<Self> {
        InputKey::ALL.iter().copied().find(|k| k.name() == name)
    }

    /// Whether this input key is a pointer button rather than a keyboard key.
    pub fn is_pointer(self) -> bool {
        matches!(
            self,
            InputKey::MiddleClick | InputKey::Mouse4 | InputKey::Mouse5
        )
    }
}

impl fmt::Display for InputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A key the engine may synthesize toward the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutputKey {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    L,
    M,
    N,
    O,
    P,
    Q,
    R,
    S,
    T,
    U,
    V,
    W,
    X,
    Y,
    Z,
    Space,
    Enter,
    Escape,
    Tab,
    End,
    Home,
    Up,
    Down,
    F5,
    F6,
    PageUp,
}

impl OutputKey {
    /// All output keys, in declaration order.
    pub const ALL: [OutputKey; 37] = [
        OutputKey::A,
        OutputKey::B,
        OutputKey::C,
        OutputKey::D,
        OutputKey::E,
        OutputKey::F,
        OutputKey::G,
        OutputKey::H,
        OutputKey::I,
        OutputKey::J,
        OutputKey::K,
        OutputKey::L,
        OutputKey::M,
        OutputKey::N,
        OutputKey::O,
        OutputKey::P,
        OutputKey::Q,
        OutputKey::R,
        OutputKey::S,
        OutputKey::T,
        OutputKey::U,
        OutputKey::V,
        OutputKey::W,
        OutputKey::X,
        OutputKey::Y,
        OutputKey::Z,
        OutputKey::Space,
        OutputKey::Enter,
        OutputKey::Escape,
        OutputKey::Tab,
        OutputKey::End,
        OutputKey::Home,
        OutputKey::Up,
        OutputKey::Down,
        OutputKey::F5,
        OutputKey::F6,
        OutputKey::PageUp,
    ];

    /// Canonical uppercase name.
    pub fn name(self) -> &'static str {
        match self {
            OutputKey::A => "A",
            OutputKey::B => "B",
            OutputKey::C => "C",
            OutputKey::D => "D",
            OutputKey::E => "E",
            OutputKey::F => "F",
            OutputKey::G => "G",
            OutputKey::H => "H",
            OutputKey::I => "I",
            OutputKey::J => "J",
            OutputKey::K => "K",
            OutputKey::L => "L",
            OutputKey::M => "M",
            OutputKey::N => "N",
            OutputKey::O => "O",
            OutputKey::P => "P",
            OutputKey::Q => "Q",
            OutputKey::R => "R",
            OutputKey::S => "S",
            OutputKey::T => "T",
            OutputKey::U => "U",
            OutputKey::V => "V",
            OutputKey::W => "W",
            OutputKey::X => "X",
            OutputKey::Y => "Y",
            OutputKey::Z => "Z",
            OutputKey::Space => "SPACE",
            OutputKey::Enter => "ENTER",
            OutputKey::Escape => "ESCAPE",
            OutputKey::Tab => "TAB",
            OutputKey::End => "END",
            OutputKey::Home => "HOME",
            OutputKey::Up => "UP",
            OutputKey::Down => "DOWN",
            OutputKey::F5 => "F5",
            OutputKey::F6 => "F6",
            OutputKey::PageUp => "PAGEUP",
        }
    }

    /// Look up an output key by its canonical uppercase name.
    pub fn from_name(name: &str) -> Option<Self> {
        OutputKey::ALL.iter().copied().find(|k| k.name() == name)
    }
}

impl fmt::Display for OutputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A modifier key. Declaration order is also display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modifier {
    Shift,
    Alt,
    Control,
}

impl Modifier {
    const ALL: [Modifier; 3] = [Modifier::Shift, Modifier::Alt, Modifier::Control];

    /// Parse a modifier name (case-insensitive). "CTRL" is accepted as an
    /// alias for "CONTROL".
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "SHIFT" => Some(Modifier::Shift),
            "ALT" => Some(Modifier::Alt),
            "CONTROL" | "CTRL" => Some(Modifier::Control),
            _ => None,
        }
    }

    fn bit(self) -> u8 {
        match self {
            Modifier::Shift => 0b001,
            Modifier::Alt => 0b010,
            Modifier::Control => 0b100,
        }
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modifier::Shift => f.write_str("SHIFT"),
            Modifier::Alt => f.write_str("ALT"),
            Modifier::Control => f.write_str("CONTROL"),
        }
    }
}

/// A set of modifiers. Equality and hashing ignore insertion order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModifierSet(u8);

impl ModifierSet {
    /// The empty set.
    pub const EMPTY: ModifierSet = ModifierSet(0);

    /// Build a set from a slice of modifiers.
    pub fn from_mods(mods: &[Modifier]) -> Self {
        let mut set = ModifierSet::EMPTY;
        for m in mods {
            set.insert(*m);
        }
        set
    }

    /// Insert a modifier. Returns false if it was already present.
    pub fn insert(&mut self, m: Modifier) -> bool {
        let had = self.contains(m);
        self.0 |= m.bit();
        !had
    }

    pub fn contains(self, m: Modifier) -> bool {
        self.0 & m.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterate modifiers in declaration order (Shift, Alt, Control).
    pub fn iter(self) -> impl Iterator<Item = Modifier> {
        Modifier::ALL.into_iter().filter(move |m| self.contains(*m))
    }
}

impl fmt::Display for ModifierSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for m in self.iter() {
            if !first {
                f.write_str("+")?;
            }
            write!(f, "{m}")?;
            first = false;
        }
        Ok(())
    }
}

/// An output key together with its modifier set.
///
/// External representation is `"MOD+MOD+BASE"`, uppercase, with canonical
/// equality ignoring modifier order: `"SHIFT+ALT+R"` and `"ALT+SHIFT+R"`
/// parse to the same value. The *raw* projection discards modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedKey {
    pub base: OutputKey,
    pub modifiers: ModifierSet,
}

impl QualifiedKey {
    /// A bare key with no modifiers.
    pub fn bare(base: OutputKey) -> Self {
        QualifiedKey {
            base,
            modifiers: ModifierSet::EMPTY,
        }
    }

    pub fn with_modifiers(base: OutputKey, modifiers: ModifierSet) -> Self {
        QualifiedKey { base, modifiers }
    }

    /// The raw projection: the base key with modifiers discarded.
    pub fn raw(self) -> OutputKey {
        self.base
    }

    /// Parse a `"MOD+MOD+BASE"` string. Every component except the last must
    /// be a modifier; the last must be an output key.
    pub fn parse(input: &str) -> Result<Self, KeyParseError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(KeyParseError::Empty);
        }

        let parts: Vec<&str> = trimmed.split('+').map(str::trim).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(KeyParseError::EmptyComponent {
                input: trimmed.to_string(),
            });
        }

        let mut modifiers = ModifierSet::EMPTY;
        let (base_part, mod_parts) = parts.split_last().unwrap_or((&trimmed, &[]));

        for part in mod_parts {
            match Modifier::from_name(part) {
                Some(m) => {
                    if !modifiers.insert(m) {
                        return Err(KeyParseError::DuplicateModifier {
                            input: trimmed.to_string(),
                            modifier: m,
                        });
                    }
                }
                None => {
                    return Err(KeyParseError::UnknownModifier {
                        input: trimmed.to_string(),
                        name: (*part).to_string(),
                    });
                }
            }
        }

        let upper = base_part.to_uppercase();
        match OutputKey::from_name(&upper) {
            Some(base) => Ok(QualifiedKey { base, modifiers }),
            None => Err(KeyParseError::UnknownKey {
                input: trimmed.to_string(),
                name: (*base_part).to_string(),
            }),
        }
    }
}

impl fmt::Display for QualifiedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for m in self.modifiers.iter() {
            write!(f, "{m}+")?;
        }
        write!(f, "{}", self.base)
    }
}

impl FromStr for QualifiedKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QualifiedKey::parse(s)
    }
}

impl Serialize for QualifiedKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for QualifiedKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        QualifiedKey::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Failure to parse a `"MOD+MOD+BASE"` qualified key string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyParseError {
    #[error("empty key string")]
    Empty,

    #[error("empty component in key string '{input}'")]
    EmptyComponent { input: String },

    #[error("unknown modifier '{name}' in key string '{input}'")]
    UnknownModifier { input: String, name: String },

    #[error("duplicate modifier {modifier} in key string '{input}'")]
    DuplicateModifier { input: String, modifier: Modifier },

    #[error("unknown output key '{name}' in key string '{input}'")]
    UnknownKey { input: String, name: String },
}

/// Canonicalize a raw key name as delivered by a platform hook.
///
/// Uppercases, maps pointer-button aliases ("MOUSE MIDDLE" →
/// "MIDDLE_CLICK"), and strips the space from spaced numpad names
/// ("NUMPAD 8" → "NUMPAD8").
pub fn canonicalize_key_name(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    match upper.as_str() {
        "MOUSE MIDDLE" | "MIDDLE MOUSE" | "MMB" => return "MIDDLE_CLICK".to_string(),
        "MOUSE 4" | "MOUSE X1" | "XBUTTON1" => return "MOUSE4".to_string(),
        "MOUSE 5" | "MOUSE X2" | "XBUTTON2" => return "MOUSE5".to_string(),
        _ => {}
    }
    if let Some(rest) = upper.strip_prefix("NUMPAD ") {
        return format!("NUMPAD{rest}");
    }
    upper
}
