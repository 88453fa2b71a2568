//! Protocol descriptors.
//!
//! A [`ProtocolDescriptor`] is the static description of one protocol a
//! connection manager implements. Descriptors are exchanged as an immutable
//! property map ([`ProtocolDescriptor::to_properties`]); both the manifest
//! reader and the introspection path go through
//! [`ProtocolDescriptor::from_properties`], so the two construction paths
//! cannot drift apart.

use tpcm_core::{TpError, TpResult, ValueMap, Variant, is_valid_protocol_name};

use crate::param::{ParamFlags, Parameter};

/// Property names of the protocol object.
pub mod props {
    pub const INTERFACES: &str = "org.freedesktop.Telepathy.Protocol.Interfaces";
    pub const CONNECTION_INTERFACES: &str =
        "org.freedesktop.Telepathy.Protocol.ConnectionInterfaces";
    pub const PARAMETERS: &str = "org.freedesktop.Telepathy.Protocol.Parameters";
    pub const REQUESTABLE_CHANNEL_CLASSES: &str =
        "org.freedesktop.Telepathy.Protocol.RequestableChannelClasses";
    pub const VCARD_FIELD: &str = "org.freedesktop.Telepathy.Protocol.VCardField";
    pub const ENGLISH_NAME: &str = "org.freedesktop.Telepathy.Protocol.EnglishName";
    pub const ICON: &str = "org.freedesktop.Telepathy.Protocol.Icon";
    pub const AUTHENTICATION_TYPES: &str =
        "org.freedesktop.Telepathy.Protocol.AuthenticationTypes";

    pub const AVATARS_INTERFACE: &str = "org.freedesktop.Telepathy.Protocol.Interface.Avatars";
    pub const SUPPORTED_AVATAR_MIME_TYPES: &str =
        "org.freedesktop.Telepathy.Protocol.Interface.Avatars.SupportedAvatarMIMETypes";
    pub const MINIMUM_AVATAR_HEIGHT: &str =
        "org.freedesktop.Telepathy.Protocol.Interface.Avatars.MinimumAvatarHeight";
    pub const MINIMUM_AVATAR_WIDTH: &str =
        "org.freedesktop.Telepathy.Protocol.Interface.Avatars.MinimumAvatarWidth";
    pub const RECOMMENDED_AVATAR_HEIGHT: &str =
        "org.freedesktop.Telepathy.Protocol.Interface.Avatars.RecommendedAvatarHeight";
    pub const RECOMMENDED_AVATAR_WIDTH: &str =
        "org.freedesktop.Telepathy.Protocol.Interface.Avatars.RecommendedAvatarWidth";
    pub const MAXIMUM_AVATAR_HEIGHT: &str =
        "org.freedesktop.Telepathy.Protocol.Interface.Avatars.MaximumAvatarHeight";
    pub const MAXIMUM_AVATAR_WIDTH: &str =
        "org.freedesktop.Telepathy.Protocol.Interface.Avatars.MaximumAvatarWidth";
    pub const MAXIMUM_AVATAR_BYTES: &str =
        "org.freedesktop.Telepathy.Protocol.Interface.Avatars.MaximumAvatarBytes";
}

/// A `(fixed properties, allowed properties)` channel class.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestableChannelClass {
    pub fixed: ValueMap,
    pub allowed: Vec<String>,
}

impl RequestableChannelClass {
    pub fn new(fixed: ValueMap, allowed: Vec<String>) -> Self {
        Self { fixed, allowed }
    }

    /// The `(a{sv}as)` struct form.
    pub fn to_variant(&self) -> Variant {
        Variant::Struct(vec![
            Variant::Map(self.fixed.clone()),
            Variant::StringList(self.allowed.clone()),
        ])
    }

    pub fn from_variant(value: &Variant) -> Option<Self> {
        let [fixed, allowed] = value.as_struct()? else {
            return None;
        };
        Some(Self {
            fixed: fixed.as_map()?.clone(),
            allowed: allowed.as_string_list()?.to_vec(),
        })
    }
}

/// Avatar constraints. Zero means "no constraint".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvatarRequirements {
    pub mime_types: Vec<String>,
    pub minimum_width: u32,
    pub minimum_height: u32,
    pub recommended_width: u32,
    pub recommended_height: u32,
    pub maximum_width: u32,
    pub maximum_height: u32,
    pub maximum_bytes: u32,
}

impl AvatarRequirements {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Static description of a protocol.
///
/// `english_name`, `icon` and `vcard_field` hold exactly what was declared
/// (possibly empty); the accessors apply the documented defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolDescriptor {
    name: String,
    english_name: String,
    icon: String,
    vcard_field: String,
    interfaces: Vec<String>,
    connection_interfaces: Vec<String>,
    params: Vec<Parameter>,
    channel_classes: Vec<RequestableChannelClass>,
    avatars: AvatarRequirements,
    authentication_types: Vec<String>,
}

impl ProtocolDescriptor {
    /// Creates an empty descriptor.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `name` is not a valid protocol name.
    pub fn new(name: impl Into<String>) -> TpResult<Self> {
        let name = name.into();
        if !is_valid_protocol_name(&name) {
            return Err(TpError::invalid_argument(format!(
                "{name:?} is not a valid protocol name"
            )));
        }
        Ok(Self {
            name,
            english_name: String::new(),
            icon: String::new(),
            vcard_field: String::new(),
            interfaces: Vec::new(),
            connection_interfaces: Vec::new(),
            params: Vec::new(),
            channel_classes: Vec::new(),
            avatars: AvatarRequirements::default(),
            authentication_types: Vec::new(),
        })
    }

    #[must_use]
    pub fn with_english_name(mut self, name: impl Into<String>) -> Self {
        self.english_name = name.into();
        self
    }

    #[must_use]
    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = icon.into();
        self
    }

    #[must_use]
    pub fn with_vcard_field(mut self, field: impl Into<String>) -> Self {
        self.vcard_field = field.into();
        self
    }

    #[must_use]
    pub fn with_interfaces(mut self, interfaces: Vec<String>) -> Self {
        self.interfaces = interfaces;
        self
    }

    #[must_use]
    pub fn with_connection_interfaces(mut self, interfaces: Vec<String>) -> Self {
        self.connection_interfaces = interfaces;
        self
    }

    /// Appends a parameter, applying the password naming rule.
    #[must_use]
    pub fn with_param(mut self, mut param: Parameter) -> Self {
        param.apply_password_rule(&self.name);
        self.params.push(param);
        self
    }

    #[must_use]
    pub fn with_channel_class(mut self, class: RequestableChannelClass) -> Self {
        self.channel_classes.push(class);
        self
    }

    #[must_use]
    pub fn with_avatars(mut self, avatars: AvatarRequirements) -> Self {
        self.avatars = avatars;
        self
    }

    #[must_use]
    pub fn with_authentication_types(mut self, types: Vec<String>) -> Self {
        self.authentication_types = types;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared English name, or the protocol name with its first
    /// character in title case.
    pub fn english_name(&self) -> String {
        if !self.english_name.is_empty() {
            return self.english_name.clone();
        }
        let mut chars = self.name.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }

    /// Declared icon, or `im-<name>`.
    pub fn icon(&self) -> String {
        if self.icon.is_empty() {
            format!("im-{}", self.name)
        } else {
            self.icon.clone()
        }
    }

    /// vCard field for addresses on this protocol; empty if none.
    pub fn vcard_field(&self) -> &str {
        &self.vcard_field
    }

    pub(crate) fn raw_english_name(&self) -> &str {
        &self.english_name
    }

    pub(crate) fn raw_icon(&self) -> &str {
        &self.icon
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn connection_interfaces(&self) -> &[String] {
        &self.connection_interfaces
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name() == name)
    }

    pub fn param_names(&self) -> Vec<&str> {
        self.params.iter().map(Parameter::name).collect()
    }

    /// True if any parameter is flagged for account registration.
    pub fn can_register(&self) -> bool {
        self.params
            .iter()
            .any(|p| p.flags().contains(ParamFlags::REGISTER))
    }

    pub fn channel_classes(&self) -> &[RequestableChannelClass] {
        &self.channel_classes
    }

    pub fn avatars(&self) -> &AvatarRequirements {
        &self.avatars
    }

    /// Authentication types; an absent list reads as empty.
    pub fn authentication_types(&self) -> &[String] {
        &self.authentication_types
    }

    /// The immutable property map published for this protocol.
    pub fn to_properties(&self) -> ValueMap {
        let avatars = &self.avatars;
        ValueMap::new()
            .with(props::INTERFACES, self.interfaces.clone())
            .with(props::CONNECTION_INTERFACES, self.connection_interfaces.clone())
            .with(
                props::PARAMETERS,
                Variant::Array(self.params.iter().map(Parameter::to_variant).collect()),
            )
            .with(
                props::REQUESTABLE_CHANNEL_CLASSES,
                Variant::Array(
                    self.channel_classes
                        .iter()
                        .map(RequestableChannelClass::to_variant)
                        .collect(),
                ),
            )
            .with(props::VCARD_FIELD, self.vcard_field.as_str())
            .with(props::ENGLISH_NAME, self.english_name.as_str())
            .with(props::ICON, self.icon.as_str())
            .with(props::AUTHENTICATION_TYPES, self.authentication_types.clone())
            .with(props::SUPPORTED_AVATAR_MIME_TYPES, avatars.mime_types.clone())
            .with(props::MINIMUM_AVATAR_WIDTH, avatars.minimum_width)
            .with(props::MINIMUM_AVATAR_HEIGHT, avatars.minimum_height)
            .with(props::RECOMMENDED_AVATAR_WIDTH, avatars.recommended_width)
            .with(props::RECOMMENDED_AVATAR_HEIGHT, avatars.recommended_height)
            .with(props::MAXIMUM_AVATAR_WIDTH, avatars.maximum_width)
            .with(props::MAXIMUM_AVATAR_HEIGHT, avatars.maximum_height)
            .with(props::MAXIMUM_AVATAR_BYTES, avatars.maximum_bytes)
    }

    /// Builds a descriptor from an immutable property map.
    ///
    /// Missing properties read as empty; malformed parameter or channel
    /// class entries are skipped.
    pub fn from_properties(name: &str, properties: &ValueMap) -> TpResult<Self> {
        let strings = |key: &str| -> Vec<String> {
            properties
                .get_string_list(key)
                .map(<[String]>::to_vec)
                .unwrap_or_default()
        };

        let mut descriptor = Self::new(name)?;
        descriptor.interfaces = strings(props::INTERFACES);
        descriptor.connection_interfaces = strings(props::CONNECTION_INTERFACES);
        descriptor.authentication_types = strings(props::AUTHENTICATION_TYPES);
        descriptor.vcard_field = properties.get_str_or_default(props::VCARD_FIELD).to_string();
        descriptor.english_name = properties.get_str_or_default(props::ENGLISH_NAME).to_string();
        descriptor.icon = properties.get_str_or_default(props::ICON).to_string();

        let entries = |key: &str| -> Vec<Variant> {
            properties
                .get(key)
                .and_then(Variant::as_array)
                .map(<[Variant]>::to_vec)
                .unwrap_or_default()
        };
        for entry in entries(props::PARAMETERS) {
            match Parameter::from_variant(&entry) {
                Some(param) => descriptor = descriptor.with_param(param),
                None => tracing::debug!(protocol = name, "skipping malformed parameter"),
            }
        }
        descriptor.channel_classes = entries(props::REQUESTABLE_CHANNEL_CLASSES)
            .iter()
            .filter_map(RequestableChannelClass::from_variant)
            .collect();

        descriptor.avatars = AvatarRequirements {
            mime_types: strings(props::SUPPORTED_AVATAR_MIME_TYPES),
            minimum_width: properties.get_u32_or_default(props::MINIMUM_AVATAR_WIDTH),
            minimum_height: properties.get_u32_or_default(props::MINIMUM_AVATAR_HEIGHT),
            recommended_width: properties.get_u32_or_default(props::RECOMMENDED_AVATAR_WIDTH),
            recommended_height: properties.get_u32_or_default(props::RECOMMENDED_AVATAR_HEIGHT),
            maximum_width: properties.get_u32_or_default(props::MAXIMUM_AVATAR_WIDTH),
            maximum_height: properties.get_u32_or_default(props::MAXIMUM_AVATAR_HEIGHT),
            maximum_bytes: properties.get_u32_or_default(props::MAXIMUM_AVATAR_BYTES),
        };
        Ok(descriptor)
    }
}
