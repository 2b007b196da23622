//! Process-wide tunables read from the environment on every cold open.
//!
//! Three variables are consulted:
//!
//! - `HSAKMT_DEBUG_LEVEL`: verbosity, honored only inside
//!   [`DebugLevel::ERR`]..=[`DebugLevel::DEBUG`].
//! - `HSA_ZFB`: non-zero enables zero-framebuffer emulation.
//! - `HSA_FORCE_ASIC_TYPE`: forces every GPU to report one identity, e.g.
//!   `"10.1.0 1 Navi10 14"` meaning `major.minor.stepping dgpu name family`.

use std::collections::HashMap;
use std::ffi::OsString;

use tracing::level_filters::LevelFilter;

use crate::error::ConfigError;

pub const DEBUG_LEVEL_ENV_VAR: &str = "HSAKMT_DEBUG_LEVEL";
pub const ZERO_FRAME_BUFFER_ENV_VAR: &str = "HSA_ZFB";
pub const FORCE_ASIC_TYPE_ENV_VAR: &str = "HSA_FORCE_ASIC_TYPE";

const MAX_MAJOR: u32 = 63;
const MAX_MINOR: u32 = 255;
const MAX_STEPPING: u32 = 255;
const MAX_ASIC_NAME_LEN: usize = 63;

/// Read access to environment variables. Values are returned as the OS
/// stored them, so callers decide how to treat bytes that are not UTF-8.
pub trait EnvSource: Send + Sync {
    fn var_os(&self, key: &str) -> Option<OsString>;
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var_os(&self, key: &str) -> Option<OsString> {
        std::env::var_os(key)
    }
}

impl EnvSource for HashMap<String, String> {
    fn var_os(&self, key: &str) -> Option<OsString> {
        self.get(key).map(OsString::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DebugLevel(i32);

impl DebugLevel {
    pub const DEFAULT: Self = Self(-1);
    pub const ERR: Self = Self(3);
    pub const WARNING: Self = Self(4);
    pub const NOTICE: Self = Self(5);
    pub const INFO: Self = Self(6);
    pub const DEBUG: Self = Self(7);

    /// Parses `raw` the way C `atoi` does and keeps it only when it falls
    /// inside the supported range.
    pub fn parse(raw: &str) -> Self {
        let level = atoi(raw);
        if (Self::ERR.0..=Self::DEBUG.0).contains(&level) {
            Self(level)
        } else {
            Self::DEFAULT
        }
    }

    pub fn from_env(env: &dyn EnvSource) -> Self {
        env.var_os(DEBUG_LEVEL_ENV_VAR)
            .map_or(Self::DEFAULT, |raw| Self::parse(&raw.to_string_lossy()))
    }

    pub fn value(self) -> i32 {
        self.0
    }

    pub fn level_filter(self) -> LevelFilter {
        match self.0 {
            3 => LevelFilter::ERROR,
            4 => LevelFilter::WARN,
            5 | 6 => LevelFilter::INFO,
            7 => LevelFilter::DEBUG,
            _ => LevelFilter::OFF,
        }
    }
}

impl Default for DebugLevel {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// GPU families understood by the forced-identity override, in id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsicFamily {
    Kaveri,
    Hawaii,
    Carrizo,
    Tonga,
    Fiji,
    Polaris10,
    Polaris11,
    Polaris12,
    VegaM,
    Vega10,
    Vega12,
    Vega20,
    Raven,
    Arcturus,
    Navi10,
    Navi12,
    Navi14,
    Renoir,
    SiennaCichlid,
    NavyFlounder,
    DimgreyCavefish,
    VanGogh,
    Aldebaran,
    BeigeGoby,
    YellowCarp,
}

impl AsicFamily {
    pub const ALL: [AsicFamily; 25] = [
        Self::Kaveri,
        Self::Hawaii,
        Self::Carrizo,
        Self::Tonga,
        Self::Fiji,
        Self::Polaris10,
        Self::Polaris11,
        Self::Polaris12,
        Self::VegaM,
        Self::Vega10,
        Self::Vega12,
        Self::Vega20,
        Self::Raven,
        Self::Arcturus,
        Self::Navi10,
        Self::Navi12,
        Self::Navi14,
        Self::Renoir,
        Self::SiennaCichlid,
        Self::NavyFlounder,
        Self::DimgreyCavefish,
        Self::VanGogh,
        Self::Aldebaran,
        Self::BeigeGoby,
        Self::YellowCarp,
    ];

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.get(usize::try_from(id).ok()?).copied()
    }

    pub fn id(self) -> u32 {
        self as u32
    }
}

/// Identity every GPU node reports while `HSA_FORCE_ASIC_TYPE` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcedAsic {
    pub major: u8,
    pub minor: u8,
    pub stepping: u8,
    pub is_dgpu: bool,
    pub name: String,
    pub family: AsicFamily,
}

impl ForcedAsic {
    /// Parses `"<major>.<minor>.<stepping> <dgpu> <name> <family_id>"`.
    ///
    /// Whitespace between fields is free-form and text after the family id
    /// is ignored. The name is limited to 63 bytes.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let field_count = |parsed| ConfigError::FieldCount {
            value: value.to_string(),
            parsed,
        };

        let mut scanner = Scanner::new(value);
        let major = scanner.unsigned().ok_or_else(|| field_count(0))?;
        let minor = scanner
            .literal('.')
            .then(|| scanner.unsigned())
            .flatten()
            .ok_or_else(|| field_count(1))?;
        let stepping = scanner
            .literal('.')
            .then(|| scanner.unsigned())
            .flatten()
            .ok_or_else(|| field_count(2))?;
        let dgpu = scanner.unsigned().ok_or_else(|| field_count(3))?;
        let name = scanner.word().ok_or_else(|| field_count(4))?;
        if name.len() > MAX_ASIC_NAME_LEN {
            return Err(ConfigError::NameTooLong {
                value: value.to_string(),
                max: MAX_ASIC_NAME_LEN,
            });
        }
        let family_id = scanner.unsigned().ok_or_else(|| field_count(5))?;

        let major = check_range(value, "major", major, MAX_MAJOR)?;
        let minor = check_range(value, "minor", minor, MAX_MINOR)?;
        let stepping = check_range(value, "stepping", stepping, MAX_STEPPING)?;
        let dgpu = check_range(value, "dgpu", dgpu, 1)?;
        let family_id = u32::try_from(family_id).unwrap_or(u32::MAX);
        let family = AsicFamily::from_id(family_id).ok_or_else(|| ConfigError::UnknownFamily {
            value: value.to_string(),
            family_id,
        })?;

        Ok(Self {
            major: major as u8,
            minor: minor as u8,
            stepping: stepping as u8,
            is_dgpu: dgpu == 1,
            name: name.to_string(),
            family,
        })
    }
}

fn check_range(value: &str, field: &'static str, actual: u64, max: u32) -> Result<u32, ConfigError> {
    match u32::try_from(actual) {
        Ok(actual) if actual <= max => Ok(actual),
        _ => Err(ConfigError::OutOfRange {
            value: value.to_string(),
            field,
            actual: u32::try_from(actual).unwrap_or(u32::MAX),
            max,
        }),
    }
}

/// Settings captured at cold open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub debug_level: DebugLevel,
    pub zero_frame_buffer: bool,
    pub forced_asic: Option<ForcedAsic>,
}

impl RuntimeConfig {
    pub fn load(env: &dyn EnvSource) -> Result<Self, ConfigError> {
        let debug_level = DebugLevel::from_env(env);
        let zero_frame_buffer = env
            .var_os(ZERO_FRAME_BUFFER_ENV_VAR)
            .is_some_and(|raw| atoi(&raw.to_string_lossy()) != 0);
        let forced_asic = env
            .var_os(FORCE_ASIC_TYPE_ENV_VAR)
            .map(forced_asic_from_env)
            .transpose()
            .inspect_err(|err| tracing::error!("{err}"))?;

        Ok(Self {
            debug_level,
            zero_frame_buffer,
            forced_asic,
        })
    }
}

fn forced_asic_from_env(raw: OsString) -> Result<ForcedAsic, ConfigError> {
    let raw = raw.into_string().map_err(|raw| ConfigError::NotUnicode {
        value: raw.to_string_lossy().into_owned(),
    })?;
    ForcedAsic::parse(&raw)
}

/// The C locale's `isspace`.
fn is_c_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\x0b' | '\x0c' | '\r')
}

/// C `atoi`: optional leading whitespace and sign, then digits. Anything
/// unparsable reads as zero.
fn atoi(raw: &str) -> i32 {
    let trimmed = raw.trim_start_matches(is_c_space);
    let (negative, digits) = match trimmed.as_bytes().first().copied() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let mut value: i64 = 0;
    for byte in digits.bytes().take_while(u8::is_ascii_digit) {
        value = value
            .saturating_mul(10)
            .saturating_add(i64::from(byte - b'0'));
    }
    let value = if negative { -value } else { value };
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Minimal `scanf`-style cursor over the override string.
struct Scanner<'a> {
    rest: &'a str,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self { rest: input }
    }

    fn skip_whitespace(&mut self) {
        self.rest = self.rest.trim_start_matches(is_c_space);
    }

    fn literal(&mut self, expected: char) -> bool {
        match self.rest.strip_prefix(expected) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn unsigned(&mut self) -> Option<u64> {
        self.skip_whitespace();
        let body = self.rest.strip_prefix('+').unwrap_or(self.rest);
        let len = body.bytes().take_while(u8::is_ascii_digit).count();
        if len == 0 {
            return None;
        }
        let value = body[..len].parse::<u64>().unwrap_or(u64::MAX);
        self.rest = &body[len..];
        Some(value)
    }

    fn word(&mut self) -> Option<&'a str> {
        self.skip_whitespace();
        let len = self
            .rest
            .find(is_c_space)
            .unwrap_or(self.rest.len());
        if len == 0 {
            return None;
        }
        let (word, rest) = self.rest.split_at(len);
        self.rest = rest;
        Some(word)
    }
}
