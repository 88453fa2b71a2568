//! `.manager` manifest files.
//!
//! A manifest describes every protocol a connection manager implements so
//! clients can configure accounts without starting the manager. The file
//! has an optional `[ConnectionManager]` group, one `[Protocol <name>]`
//! group per protocol, and one group per requestable channel class
//! referenced from a protocol's `RequestableChannelClasses` key.

use std::collections::HashSet;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use tpcm_core::{ValueMap, Variant, is_valid_protocol_name};
use tracing::{debug, info, warn};

use crate::descriptor::{ProtocolDescriptor, RequestableChannelClass, props};
use crate::error::{ManifestError, ManifestResult};
use crate::keyfile::{self, Group, KeyFile};
use crate::param::{Parameter, format_value, parse_value};

const CM_GROUP: &str = "ConnectionManager";
const PROTOCOL_PREFIX: &str = "Protocol ";
const DEFAULT_DATA_DIRS: &str = "/usr/local/share:/usr/share";

/// Keys of a protocol group holding string lists, with their property.
const LIST_KEYS: [(&str, &str); 4] = [
    ("Interfaces", props::INTERFACES),
    ("ConnectionInterfaces", props::CONNECTION_INTERFACES),
    ("AuthenticationTypes", props::AUTHENTICATION_TYPES),
    ("SupportedAvatarMIMETypes", props::SUPPORTED_AVATAR_MIME_TYPES),
];

/// Keys of a protocol group holding plain strings.
const STRING_KEYS: [(&str, &str); 3] = [
    ("VCardField", props::VCARD_FIELD),
    ("EnglishName", props::ENGLISH_NAME),
    ("Icon", props::ICON),
];

/// Avatar size keys, in output order.
const AVATAR_KEYS: [(&str, &str); 7] = [
    ("MinimumAvatarWidth", props::MINIMUM_AVATAR_WIDTH),
    ("MinimumAvatarHeight", props::MINIMUM_AVATAR_HEIGHT),
    ("RecommendedAvatarWidth", props::RECOMMENDED_AVATAR_WIDTH),
    ("RecommendedAvatarHeight", props::RECOMMENDED_AVATAR_HEIGHT),
    ("MaximumAvatarWidth", props::MAXIMUM_AVATAR_WIDTH),
    ("MaximumAvatarHeight", props::MAXIMUM_AVATAR_HEIGHT),
    ("MaximumAvatarBytes", props::MAXIMUM_AVATAR_BYTES),
];

#[derive(Debug, Clone, PartialEq)]
struct ManifestProtocol {
    descriptor: ProtocolDescriptor,
    class_groups: Vec<String>,
}

/// A parsed manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    manager: Option<Vec<(String, String)>>,
    protocols: Vec<ManifestProtocol>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a raw `[ConnectionManager]` entry.
    #[must_use]
    pub fn with_manager_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.manager
            .get_or_insert_with(Vec::new)
            .push((key.into(), value.into()));
        self
    }

    /// Adds a protocol; its channel classes get generated group names.
    #[must_use]
    pub fn with_protocol(mut self, descriptor: ProtocolDescriptor) -> Self {
        let class_groups = (1..=descriptor.channel_classes().len())
            .map(|i| format!("{} class {i}", descriptor.name()))
            .collect();
        self.protocols.push(ManifestProtocol {
            descriptor,
            class_groups,
        });
        self
    }

    /// Raw value of a `[ConnectionManager]` key.
    pub fn manager_entry(&self, key: &str) -> Option<&str> {
        self.manager
            .as_ref()?
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn protocols(&self) -> impl Iterator<Item = &ProtocolDescriptor> {
        self.protocols.iter().map(|p| &p.descriptor)
    }

    pub fn protocol(&self, name: &str) -> Option<&ProtocolDescriptor> {
        self.protocols().find(|d| d.name() == name)
    }

    /// Reads and parses the manifest at `path`.
    pub fn load(path: &Path) -> ManifestResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest = Self::parse(&text)?;
        info!(
            path = %path.display(),
            protocols = manifest.protocols.len(),
            "loaded manifest"
        );
        Ok(manifest)
    }

    /// Parses manifest text.
    ///
    /// Groups for protocols with invalid names are skipped, as are
    /// parameter defaults that do not parse against their signature.
    pub fn parse(text: &str) -> ManifestResult<Self> {
        let file = KeyFile::parse(text)?;
        let mut manifest = Manifest {
            manager: file.group(CM_GROUP).map(|g| g.entries.clone()),
            protocols: Vec::new(),
        };

        for group in &file.groups {
            let Some(name) = group.name.strip_prefix(PROTOCOL_PREFIX) else {
                continue;
            };
            if !is_valid_protocol_name(name) {
                debug!(protocol = name, "skipping protocol with an invalid name");
                continue;
            }
            let (properties, class_groups) = protocol_properties(&file, group);
            let descriptor = ProtocolDescriptor::from_properties(name, &properties).map_err(
                |source| ManifestError::Protocol {
                    protocol: name.to_string(),
                    source,
                },
            )?;
            manifest.protocols.push(ManifestProtocol {
                descriptor,
                class_groups,
            });
        }
        Ok(manifest)
    }

    fn to_keyfile(&self) -> KeyFile {
        let mut file = KeyFile::default();
        if let Some(entries) = &self.manager {
            file.groups.push(Group {
                name: CM_GROUP.to_string(),
                entries: entries.clone(),
            });
        }

        let mut written_classes = HashSet::new();
        for protocol in &self.protocols {
            file.groups.push(protocol_group(protocol));
            let classes = protocol
                .class_groups
                .iter()
                .zip(protocol.descriptor.channel_classes());
            for (group_name, class) in classes {
                if written_classes.insert(group_name.clone()) {
                    file.groups.push(class_group(group_name, class));
                }
            }
        }
        file
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_keyfile().write())
    }
}

fn protocol_properties(file: &KeyFile, group: &Group) -> (ValueMap, Vec<String>) {
    let mut properties = ValueMap::new();

    let mut seen = HashSet::new();
    let mut params = Vec::new();
    for (key, _) in &group.entries {
        let Some(name) = key.strip_prefix("param-") else {
            continue;
        };
        if !seen.insert(name) {
            continue;
        }
        let Some(line) = group.get(key) else { continue };
        let Some(mut param) = Parameter::from_manifest_line(name, line) else {
            warn!(param = name, "parameter has no signature, skipping");
            continue;
        };
        if let Some(raw) = group.get(&format!("default-{name}")) {
            match parse_value(param.signature(), raw) {
                Some(value) => param = param.with_default(value),
                None => debug!(
                    param = name,
                    signature = param.signature(),
                    raw,
                    "dropping default that does not match the signature"
                ),
            }
        }
        params.push(param.to_variant());
    }
    properties.insert(props::PARAMETERS, Variant::Array(params));

    for (key, prop) in LIST_KEYS {
        let list = group
            .get(key)
            .and_then(keyfile::split_list)
            .unwrap_or_default();
        properties.insert(prop, list);
    }
    for (key, prop) in STRING_KEYS {
        let value = group
            .get(key)
            .and_then(keyfile::unescape)
            .unwrap_or_default();
        properties.insert(prop, value);
    }
    for (key, prop) in AVATAR_KEYS {
        let value = group
            .get(key)
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
            .unwrap_or_default();
        properties.insert(prop, value);
    }

    let class_groups = group
        .get("RequestableChannelClasses")
        .and_then(keyfile::split_list)
        .unwrap_or_default();
    let classes = class_groups
        .iter()
        .map(|name| match file.group(name) {
            Some(g) => channel_class(g).to_variant(),
            None => {
                warn!(group = %name, "requestable channel class group is missing");
                RequestableChannelClass::default().to_variant()
            }
        })
        .collect();
    properties.insert(props::REQUESTABLE_CHANNEL_CLASSES, Variant::Array(classes));

    (properties, class_groups)
}

fn channel_class(group: &Group) -> RequestableChannelClass {
    let mut fixed = ValueMap::new();
    for (key, raw) in &group.entries {
        // keys without a space are reserved
        let Some((property, signature)) = key.split_once(' ') else {
            continue;
        };
        match parse_value(signature, raw) {
            Some(value) => {
                fixed.insert(property, value);
            }
            None => debug!(property, signature, "skipping unparsable fixed property"),
        }
    }
    let allowed = group
        .get("allowed")
        .and_then(keyfile::split_list)
        .unwrap_or_default();
    RequestableChannelClass::new(fixed, allowed)
}

fn protocol_group(protocol: &ManifestProtocol) -> Group {
    let d = &protocol.descriptor;
    let mut group = Group::new(format!("{PROTOCOL_PREFIX}{}", d.name()));

    let mut push_list = |group: &mut Group, key: &str, list: &[String]| {
        if !list.is_empty() {
            group.push(key, keyfile::join_list(list));
        }
    };
    push_list(&mut group, "Interfaces", d.interfaces());
    push_list(&mut group, "ConnectionInterfaces", d.connection_interfaces());
    push_list(&mut group, "RequestableChannelClasses", &protocol.class_groups);
    push_list(&mut group, "AuthenticationTypes", d.authentication_types());

    for (key, value) in [
        ("VCardField", d.vcard_field()),
        ("EnglishName", d.raw_english_name()),
        ("Icon", d.raw_icon()),
    ] {
        if !value.is_empty() {
            group.push(key, keyfile::escape(value));
        }
    }

    let avatars = d.avatars();
    push_list(&mut group, "SupportedAvatarMIMETypes", &avatars.mime_types);
    let sizes = [
        avatars.minimum_width,
        avatars.minimum_height,
        avatars.recommended_width,
        avatars.recommended_height,
        avatars.maximum_width,
        avatars.maximum_height,
        avatars.maximum_bytes,
    ];
    for ((key, _), size) in AVATAR_KEYS.iter().zip(sizes) {
        if size != 0 {
            group.push(*key, size.to_string());
        }
    }

    for param in d.params() {
        group.push(format!("param-{}", param.name()), param.manifest_line());
        if let Some(default) = param.default_value() {
            group.push(format!("default-{}", param.name()), format_value(default));
        }
    }
    group
}

fn class_group(name: &str, class: &RequestableChannelClass) -> Group {
    let mut group = Group::new(name);
    for (property, value) in class.fixed.iter() {
        group.push(format!("{property} {}", value.signature()), format_value(value));
    }
    if !class.allowed.is_empty() {
        group.push("allowed", keyfile::join_list(&class.allowed));
    }
    group
}

/// Directories searched for manifests, highest priority first:
/// `$XDG_DATA_HOME` (or the platform data directory), then each entry of
/// `$XDG_DATA_DIRS` (default `/usr/local/share:/usr/share`).
pub fn search_dirs() -> Vec<PathBuf> {
    let non_empty = |var: &str| env::var_os(var).filter(|v| !v.is_empty());

    let mut dirs: Vec<PathBuf> = non_empty("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(dirs::data_dir)
        .into_iter()
        .collect();

    let data_dirs = non_empty("XDG_DATA_DIRS")
        .and_then(|v| v.into_string().ok())
        .unwrap_or_else(|| DEFAULT_DATA_DIRS.to_string());
    dirs.extend(
        data_dirs
            .split(':')
            .filter(|d| !d.is_empty())
            .map(PathBuf::from),
    );
    dirs
}

/// Path of `<manager>.manager` below a data directory.
pub fn manifest_path(data_dir: &Path, manager: &str) -> PathBuf {
    data_dir
        .join("telepathy")
        .join("managers")
        .join(format!("{manager}.manager"))
}

/// First existing manifest for `manager` in `dirs`.
pub fn find_in(manager: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| manifest_path(dir, manager))
        .find(|path| path.is_file())
}

/// Locates the manifest for `manager` on the standard search path.
pub fn find(manager: &str) -> ManifestResult<PathBuf> {
    find_in(manager, &search_dirs()).ok_or_else(|| ManifestError::NotFound(manager.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::ParamFlags;
    use proptest::prelude::*;

    const JABBER: &str = "\
[ConnectionManager]
Interfaces =

[Protocol jabber]
ConnectionInterfaces = org.freedesktop.Telepathy.Connection.Interface.Requests
RequestableChannelClasses = jabber text
VCardField = x-jabber
EnglishName = Jabber
SupportedAvatarMIMETypes = image/png,image/jpeg
MaximumAvatarBytes = 8192
param-account = s required register
param-password = s secret required
param-port = q
default-port = 5222
param-require-encryption = b
default-require-encryption = true
param-fallback-servers = as
default-fallback-servers = a.example.com,b.example.com

[jabber text]
org.freedesktop.Telepathy.Channel.ChannelType s = org.freedesktop.Telepathy.Channel.Type.Text
org.freedesktop.Telepathy.Channel.TargetHandleType u = 1
allowed = org.freedesktop.Telepathy.Channel.TargetHandle,org.freedesktop.Telepathy.Channel.TargetID
";

    #[test]
    fn parses_parameters_and_defaults() {
        let manifest = Manifest::parse(JABBER).unwrap();
        let jabber = manifest.protocol("jabber").unwrap();

        let port = jabber.param("port").unwrap();
        assert_eq!(port.default_value(), Some(&Variant::UInt16(5222)));
        assert!(port.flags().contains(ParamFlags::HAS_DEFAULT));

        let password = jabber.param("password").unwrap();
        assert_eq!(password.flags(), ParamFlags::REQUIRED | ParamFlags::SECRET);
        assert_eq!(password.default_value(), None);

        assert_eq!(
            jabber.param("require-encryption").unwrap().default_value(),
            Some(&Variant::Bool(true))
        );
        assert!(jabber.can_register());
        assert_eq!(jabber.english_name(), "Jabber");
        assert_eq!(jabber.icon(), "im-jabber");
        assert_eq!(jabber.avatars().maximum_bytes, 8192);
        assert_eq!(jabber.avatars().mime_types, vec!["image/png", "image/jpeg"]);
        assert!(jabber.authentication_types().is_empty());
        assert_eq!(manifest.manager_entry("Interfaces"), Some(""));
    }

    #[test]
    fn parses_channel_classes() {
        let manifest = Manifest::parse(JABBER).unwrap();
        let classes = manifest.protocol("jabber").unwrap().channel_classes();
        assert_eq!(classes.len(), 1);
        assert_eq!(
            classes[0]
                .fixed
                .get_u32("org.freedesktop.Telepathy.Channel.TargetHandleType"),
            Some(1)
        );
        assert_eq!(classes[0].allowed.len(), 2);
    }

    #[test]
    fn reserialization_keeps_parameter_lines() {
        let text = Manifest::parse(JABBER).unwrap().to_string();
        assert!(text.contains("\nparam-password = s secret required\n"));
        assert!(text.contains("\nparam-port = q\ndefault-port = 5222\n"));
        assert_eq!(text, JABBER);
    }

    #[test]
    fn canonical_output_is_stable() {
        let text = Manifest::parse(JABBER).unwrap().to_string();
        insta::assert_snapshot!("jabber_manifest", text);
    }

    #[test]
    fn password_without_secret_gains_it() {
        let manifest =
            Manifest::parse("[Protocol irc]\nparam-password = s\nparam-nick-password = s\n").unwrap();
        let irc = manifest.protocol("irc").unwrap();
        assert!(irc.param("password").unwrap().is_secret());
        assert!(irc.param("nick-password").unwrap().is_secret());
        assert!(manifest.to_string().contains("param-password = s secret\n"));
    }

    #[test]
    fn bad_defaults_are_dropped() {
        let manifest = Manifest::parse(
            "[Protocol x]\nparam-port = q\ndefault-port = 99999\nparam-path = o\ndefault-path = nope\n",
        )
        .unwrap();
        let x = manifest.protocol("x").unwrap();
        assert_eq!(x.param("port").unwrap().default_value(), None);
        assert!(!x.param("port").unwrap().flags().contains(ParamFlags::HAS_DEFAULT));
        assert_eq!(x.param("path").unwrap().default_value(), None);
    }

    #[test]
    fn invalid_protocol_names_are_skipped() {
        let manifest = Manifest::parse("[Protocol 1337]\nparam-a = s\n[Protocol ok]\n").unwrap();
        assert!(manifest.protocol("1337").is_none());
        assert!(manifest.protocol("ok").is_some());
    }

    #[test]
    fn semicolon_lists_are_accepted() {
        let manifest = Manifest::parse(
            "[Protocol x]\nConnectionInterfaces=a.b.C;a.b.D;\nAuthenticationTypes=\n",
        )
        .unwrap();
        let x = manifest.protocol("x").unwrap();
        assert_eq!(x.connection_interfaces(), ["a.b.C", "a.b.D"]);
        assert!(x.authentication_types().is_empty());
        assert!(manifest.to_string().contains("ConnectionInterfaces = a.b.C,a.b.D\n"));
    }

    #[test]
    fn manifest_and_properties_agree() {
        let manifest = Manifest::parse(JABBER).unwrap();
        let parsed = manifest.protocol("jabber").unwrap();
        let introspected =
            ProtocolDescriptor::from_properties("jabber", &parsed.to_properties()).unwrap();
        assert_eq!(&introspected, parsed);
    }

    #[test]
    fn lookup_prefers_earlier_directories() {
        let home = tempfile::tempdir().unwrap();
        let system = tempfile::tempdir().unwrap();
        let dirs = vec![home.path().to_path_buf(), system.path().to_path_buf()];
        assert_eq!(find_in("gabble", &dirs), None);

        let system_file = manifest_path(system.path(), "gabble");
        std::fs::create_dir_all(system_file.parent().unwrap()).unwrap();
        std::fs::write(&system_file, JABBER).unwrap();
        assert_eq!(find_in("gabble", &dirs), Some(system_file.clone()));

        let home_file = manifest_path(home.path(), "gabble");
        std::fs::create_dir_all(home_file.parent().unwrap()).unwrap();
        std::fs::write(&home_file, "[Protocol local-xmpp]\n").unwrap();
        assert_eq!(find_in("gabble", &dirs), Some(home_file.clone()));

        let loaded = Manifest::load(&home_file).unwrap();
        assert!(loaded.protocol("local-xmpp").is_some());
    }

    #[test]
    fn load_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = Manifest::load(&dir.path().join("nope.manager")).unwrap_err();
        assert!(matches!(err, ManifestError::Io { .. }));
    }

    fn arb_param() -> impl Strategy<Value = Parameter> {
        let sig_and_default = prop_oneof![
            ("s".prop_map(String::from), proptest::option::of("[ -~]{0,12}".prop_map(Variant::from))),
            ("q".prop_map(String::from), proptest::option::of(any::<u16>().prop_map(Variant::from))),
            ("i".prop_map(String::from), proptest::option::of(any::<i32>().prop_map(Variant::from))),
            ("b".prop_map(String::from), proptest::option::of(any::<bool>().prop_map(Variant::from))),
            (
                "as".prop_map(String::from),
                proptest::option::of(
                    proptest::collection::vec("[a-z.]{1,8}", 1..3).prop_map(Variant::from)
                )
            ),
        ];
        let flags = (0u32..32).prop_map(|bits| {
            ParamFlags::from_bits_truncate(bits) - ParamFlags::HAS_DEFAULT
        });
        ("[a-z][a-z-]{0,10}", flags, sig_and_default).prop_map(|(name, flags, (sig, default))| {
            let param = Parameter::new(name, sig).with_flags(flags);
            match default {
                Some(value) => param.with_default(value),
                None => param,
            }
        })
    }

    fn arb_descriptor() -> impl Strategy<Value = ProtocolDescriptor> {
        (
            "[a-z][a-z0-9]{0,6}",
            proptest::collection::vec(arb_param(), 0..5),
            proptest::collection::vec("[A-Za-z.]{1,12}", 0..3),
            "[ -~]{0,10}",
            0u32..4096,
        )
            .prop_map(|(name, params, interfaces, english, bytes)| {
                let mut d = ProtocolDescriptor::new(name)
                    .expect("generated names are valid")
                    .with_connection_interfaces(interfaces)
                    .with_english_name(english);
                let mut seen = HashSet::new();
                for param in params {
                    if seen.insert(param.name().to_string()) {
                        d = d.with_param(param);
                    }
                }
                d.with_avatars(crate::descriptor::AvatarRequirements {
                    maximum_bytes: bytes,
                    ..Default::default()
                })
            })
    }

    proptest! {
        #[test]
        fn manifest_round_trip(descriptor in arb_descriptor()) {
            let manifest = Manifest::new().with_protocol(descriptor.clone());
            let text = manifest.to_string();
            let reparsed = Manifest::parse(&text).unwrap();
            prop_assert_eq!(reparsed.protocol(descriptor.name()), Some(&descriptor));
            prop_assert_eq!(reparsed.to_string(), text);
        }
    }
}
