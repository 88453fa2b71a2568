//! Connection parameters.
//!
//! A parameter is a `(name, flags, signature, default)` tuple. The same
//! tuple appears in manifest files, in the `Parameters` protocol property
//! and in the connection manager's `GetParameters` reply.

use bitflags::bitflags;
use tpcm_core::{ObjectPath, TpError, TpResult, ValueMap, Variant, is_valid_object_path};
use tracing::{debug, warn};

use crate::keyfile;

bitflags! {
    /// Flags attached to a parameter; values are part of the wire contract.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ParamFlags: u32 {
        /// Must be supplied when connecting.
        const REQUIRED = 1;
        /// Must be supplied when registering a new account.
        const REGISTER = 2;
        /// Never log or display the value.
        const SECRET = 4;
        /// The parameter carries a default value.
        const HAS_DEFAULT = 8;
        /// Mirrors a D-Bus property of the connection.
        const DBUS_PROPERTY = 16;
    }
}

/// Flag tokens as they appear in manifest `param-` lines, in output order.
const FLAG_TOKENS: [(&str, ParamFlags); 4] = [
    ("secret", ParamFlags::SECRET),
    ("required", ParamFlags::REQUIRED),
    ("register", ParamFlags::REGISTER),
    ("dbus-property", ParamFlags::DBUS_PROPERTY),
];

/// Signatures a manifest default may be parsed against.
pub const DEFAULT_SIGNATURES: [&str; 15] = [
    "b", "y", "n", "q", "i", "u", "x", "t", "d", "s", "o", "as", "ao", "ay", "v",
];

/// One declared connection parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    name: String,
    flags: ParamFlags,
    signature: String,
    default: Option<Variant>,
}

impl Parameter {
    /// Declares a parameter with no flags and no default.
    pub fn new(name: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: ParamFlags::empty(),
            signature: signature.into(),
            default: None,
        }
    }

    /// Adds flags. `HAS_DEFAULT` is managed by [`Parameter::with_default`].
    #[must_use]
    pub fn with_flags(mut self, flags: ParamFlags) -> Self {
        self.flags |= flags - ParamFlags::HAS_DEFAULT;
        self
    }

    /// Sets the default value and the `HAS_DEFAULT` flag.
    #[must_use]
    pub fn with_default(mut self, value: impl Into<Variant>) -> Self {
        self.default = Some(value.into());
        self.flags |= ParamFlags::HAS_DEFAULT;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> ParamFlags {
        self.flags
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn default_value(&self) -> Option<&Variant> {
        self.default.as_ref()
    }

    pub fn is_required(&self) -> bool {
        self.flags.contains(ParamFlags::REQUIRED)
    }

    pub fn is_register(&self) -> bool {
        self.flags.contains(ParamFlags::REGISTER)
    }

    pub fn is_secret(&self) -> bool {
        self.flags.contains(ParamFlags::SECRET)
    }

    /// Marks `password` and `*-password` parameters secret.
    ///
    /// Returns true if the flag had to be added.
    pub(crate) fn apply_password_rule(&mut self, origin: &str) -> bool {
        let looks_secret = self.name == "password" || self.name.ends_with("-password");
        if looks_secret && !self.is_secret() {
            warn!(
                param = %self.name,
                origin,
                "treating parameter as secret because of its name"
            );
            self.flags |= ParamFlags::SECRET;
            return true;
        }
        false
    }

    /// The `(susv)` struct used in property maps.
    ///
    /// Parameters without a default carry the zero value of their type.
    pub fn to_variant(&self) -> Variant {
        let default = self
            .default
            .clone()
            .unwrap_or_else(|| zero_value(&self.signature));
        Variant::Struct(vec![
            Variant::from(self.name.as_str()),
            Variant::from(self.flags.bits()),
            Variant::from(self.signature.as_str()),
            default.boxed(),
        ])
    }

    /// Inverse of [`Parameter::to_variant`]. The default is only kept when
    /// `HAS_DEFAULT` is set.
    pub fn from_variant(value: &Variant) -> Option<Self> {
        let [name, flags, signature, default] = value.as_struct()? else {
            return None;
        };
        let flags = ParamFlags::from_bits_truncate(flags.as_u32()?);
        let default = match default {
            Variant::Variant(inner) => (**inner).clone(),
            other => other.clone(),
        };
        Some(Self {
            name: name.as_str()?.to_string(),
            flags,
            signature: signature.as_str()?.to_string(),
            default: flags.contains(ParamFlags::HAS_DEFAULT).then_some(default),
        })
    }

    /// Parses the right-hand side of a `param-<name>` manifest line.
    pub(crate) fn from_manifest_line(name: &str, line: &str) -> Option<Self> {
        let mut tokens = line.split(' ').filter(|t| !t.is_empty());
        let signature = tokens.next()?;
        let mut flags = ParamFlags::empty();
        for token in tokens {
            match FLAG_TOKENS.iter().find(|(t, _)| *t == token) {
                Some((_, flag)) => flags |= *flag,
                None => debug!(param = name, token, "ignoring unknown parameter flag"),
            }
        }
        Some(Self::new(name, signature).with_flags(flags))
    }

    /// The right-hand side of this parameter's `param-<name>` line.
    pub(crate) fn manifest_line(&self) -> String {
        let mut line = self.signature.clone();
        for (token, flag) in FLAG_TOKENS {
            if self.flags.contains(flag) {
                line.push(' ');
                line.push_str(token);
            }
        }
        line
    }

    /// Checks a client-supplied value against the signature, converting
    /// integers between widths when the value fits.
    pub fn coerce(&self, value: &Variant) -> TpResult<Variant> {
        let value = value.unboxed();
        if value.signature() == self.signature {
            return Ok(value.clone());
        }
        let converted = match self.signature.as_str() {
            "y" => value.as_u32().and_then(|v| u8::try_from(v).ok()).map(Variant::from),
            "q" => value.as_u32().and_then(|v| u16::try_from(v).ok()).map(Variant::from),
            "u" => value.as_u32().map(Variant::from),
            "t" => value.as_u64().map(Variant::from),
            "n" => value.as_i32().and_then(|v| i16::try_from(v).ok()).map(Variant::from),
            "i" => value.as_i32().map(Variant::from),
            "x" => value.as_i64().map(Variant::from),
            "o" => value.as_object_path().map(Variant::from),
            "v" => Some(value.clone()),
            _ => None,
        };
        converted.ok_or_else(|| {
            TpError::invalid_argument(format!(
                "expected type {} for account parameter {}, got {}",
                self.signature,
                self.name,
                value.signature()
            ))
        })
    }
}

/// The value reported for a parameter that has no default.
pub fn zero_value(signature: &str) -> Variant {
    match signature {
        "b" => Variant::Bool(false),
        "y" => Variant::Byte(0),
        "n" => Variant::Int16(0),
        "q" => Variant::UInt16(0),
        "i" => Variant::Int32(0),
        "u" => Variant::UInt32(0),
        "x" => Variant::Int64(0),
        "t" => Variant::UInt64(0),
        "d" => Variant::Double(0.0),
        "o" => Variant::ObjectPath(ObjectPath::root()),
        "as" => Variant::StringList(Vec::new()),
        "ao" => Variant::ObjectPathList(Vec::new()),
        "ay" => Variant::Bytes(Vec::new()),
        _ => Variant::String(String::new()),
    }
}

/// Parses a manifest value (already stripped of surrounding whitespace)
/// against `signature`. Returns `None` when the text does not fit.
pub fn parse_value(signature: &str, raw: &str) -> Option<Variant> {
    match signature {
        "b" => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" => Some(Variant::Bool(true)),
            "false" | "0" => Some(Variant::Bool(false)),
            _ => None,
        },
        "y" => raw.parse::<u8>().ok().map(Variant::from),
        "q" => raw.parse::<u16>().ok().map(Variant::from),
        "u" => raw.parse::<u32>().ok().map(Variant::from),
        "t" => raw.parse::<u64>().ok().map(Variant::from),
        "n" => raw.parse::<i16>().ok().map(Variant::from),
        "i" => raw.parse::<i32>().ok().map(Variant::from),
        "x" => raw.parse::<i64>().ok().map(Variant::from),
        "d" => raw
            .parse::<f64>()
            .ok()
            .filter(|d| d.is_finite())
            .map(Variant::from),
        "s" => keyfile::unescape(raw).map(Variant::from),
        "v" => keyfile::unescape(raw).map(Variant::from),
        "ay" => keyfile::unescape(raw).map(|s| Variant::Bytes(s.into_bytes())),
        "o" => keyfile::unescape(raw)
            .and_then(|s| ObjectPath::new(s).ok())
            .map(Variant::from),
        "as" => keyfile::split_list(raw).map(Variant::from),
        "ao" => {
            let items = keyfile::split_list(raw)?;
            if !items.iter().all(|p| is_valid_object_path(p)) {
                return None;
            }
            items
                .into_iter()
                .map(ObjectPath::new)
                .collect::<TpResult<Vec<_>>>()
                .ok()
                .map(Variant::from)
        }
        _ => None,
    }
}

/// Renders a value the way [`parse_value`] reads it back.
pub fn format_value(value: &Variant) -> String {
    match value.unboxed() {
        Variant::Bool(b) => b.to_string(),
        Variant::Byte(v) => v.to_string(),
        Variant::Int16(v) => v.to_string(),
        Variant::Int32(v) => v.to_string(),
        Variant::Int64(v) => v.to_string(),
        Variant::UInt16(v) => v.to_string(),
        Variant::UInt32(v) => v.to_string(),
        Variant::UInt64(v) => v.to_string(),
        Variant::Double(d) => d.to_string(),
        Variant::String(s) => keyfile::escape(s),
        Variant::ObjectPath(p) => p.to_string(),
        Variant::Bytes(b) => keyfile::escape(&String::from_utf8_lossy(b)),
        Variant::StringList(list) => keyfile::join_list(list),
        Variant::ObjectPathList(list) => {
            keyfile::join_list(&list.iter().map(ToString::to_string).collect::<Vec<_>>())
        }
        _ => String::new(),
    }
}

/// Validates connection parameters supplied by a client against the
/// declared `params`, returning the complete set with defaults filled in.
///
/// When the client passes `register = true`, parameters flagged
/// `REGISTER` become mandatory instead of those flagged `REQUIRED`.
pub fn validate_parameters(params: &[Parameter], provided: &ValueMap) -> TpResult<ValueMap> {
    let mandatory = if provided.get_bool("register") == Some(true) {
        ParamFlags::REGISTER
    } else {
        ParamFlags::REQUIRED
    };

    let mut remaining = provided.clone();
    let mut out = ValueMap::new();
    for param in params {
        match remaining.remove(param.name()) {
            Some(value) => {
                let value = param.coerce(&value)?;
                if param.is_secret() {
                    debug!(param = param.name(), "secret parameter supplied");
                } else {
                    debug!(param = param.name(), value = ?value, "parameter supplied");
                }
                out.insert(param.name(), value);
            }
            None if param.flags().intersects(mandatory) => {
                return Err(TpError::invalid_argument(format!(
                    "missing mandatory account parameter {}",
                    param.name()
                )));
            }
            None => {
                if let Some(default) = param.default_value() {
                    out.insert(param.name(), default.clone());
                } else {
                    debug!(param = param.name(), "not given, using default behaviour");
                }
            }
        }
    }

    if !remaining.is_empty() {
        let unknown: Vec<&str> = remaining.keys().collect();
        return Err(TpError::invalid_argument(format!(
            "unknown parameters provided: {}",
            unknown.join(" ")
        )));
    }
    Ok(out)
}
