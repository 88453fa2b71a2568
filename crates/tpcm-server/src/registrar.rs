//! Bus names and object paths of managers and connections.
//!
//! A connection of manager `gabble` for protocol `jabber` whose transport
//! reports the unique name `alice@example.com` lives at
//!
//! ```text
//! org.freedesktop.Telepathy.Connection.gabble.jabber.alice_40example_2ecom
//! /org/freedesktop/Telepathy/Connection/gabble/jabber/alice_40example_2ecom
//! ```
//!
//! Names are claimed without queueing: if someone else already owns the
//! name, registration fails with `NotAvailable`.

use tpcm_core::{ObjectPath, TpError, TpResult, escape_as_identifier, escape_protocol};
use tracing::{debug, warn};

use crate::context::{Context, RequestNameReply};

/// True for a manager name: an ASCII letter followed by letters, digits
/// and underscores.
pub fn is_valid_manager_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// True for a dotted well-known name with at least two elements, each
/// starting with a letter or underscore.
pub fn is_valid_bus_name(name: &str) -> bool {
    let elements: Vec<&str> = name.split('.').collect();
    name.len() <= 255
        && elements.len() >= 2
        && elements.iter().all(|element| {
            let mut chars = element.chars();
            match chars.next() {
                Some(first) if first.is_ascii_alphabetic() || first == '_' => {
                    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                }
                _ => false,
            }
        })
}

fn base_path(base: &str) -> String {
    format!("/{}", base.replace('.', "/"))
}

/// A bus name with the object path that goes with it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BusNames {
    pub bus_name: String,
    pub object_path: ObjectPath,
}

/// Names of the manager called `manager`.
pub fn manager_names(base: &str, manager: &str) -> TpResult<BusNames> {
    check_manager(manager)?;
    Ok(BusNames {
        bus_name: format!("{base}.ConnectionManager.{manager}"),
        object_path: ObjectPath::new(format!("{}/ConnectionManager/{manager}", base_path(base)))?,
    })
}

/// Names of a connection. `unique` is escaped; when the transport offers
/// none, an anonymous `_<n>` from the context counter is used.
pub fn connection_names(
    ctx: &Context,
    base: &str,
    manager: &str,
    protocol: &str,
    unique: Option<&str>,
) -> TpResult<BusNames> {
    check_manager(manager)?;
    let protocol = escape_protocol(protocol);
    let unique = match unique {
        Some(name) => escape_as_identifier(name),
        None => format!("_{}", ctx.next_anonymous()),
    };
    Ok(BusNames {
        bus_name: format!("{base}.Connection.{manager}.{protocol}.{unique}"),
        object_path: ObjectPath::new(format!(
            "{}/Connection/{manager}/{protocol}/{unique}",
            base_path(base)
        ))?,
    })
}

fn check_manager(manager: &str) -> TpResult<()> {
    if is_valid_manager_name(manager) {
        Ok(())
    } else {
        Err(TpError::invalid_argument(format!(
            "{manager:?} is not a valid connection manager name"
        )))
    }
}

/// Claims `names.bus_name` on the context's bus.
pub fn claim(ctx: &Context, names: &BusNames) -> TpResult<()> {
    if !is_valid_bus_name(&names.bus_name) {
        return Err(TpError::invalid_argument(format!(
            "{:?} is not a valid bus name",
            names.bus_name
        )));
    }
    match ctx.bus().request_name(&names.bus_name) {
        RequestNameReply::PrimaryOwner => {
            debug!(bus_name = %names.bus_name, path = %names.object_path, "claimed bus name");
            Ok(())
        }
        RequestNameReply::Exists => Err(TpError::not_available(format!(
            "bus name {} is already in use",
            names.bus_name
        ))),
        RequestNameReply::AlreadyOwner => Err(TpError::not_available(format!(
            "bus name {} is already registered by this process",
            names.bus_name
        ))),
        RequestNameReply::InQueue => Err(TpError::not_available(format!(
            "request for bus name {} was unexpectedly queued",
            names.bus_name
        ))),
    }
}

/// Releases a claimed name; a name we no longer own is only logged.
pub fn release(ctx: &Context, names: &BusNames) {
    if ctx.bus().release_name(&names.bus_name) {
        debug!(bus_name = %names.bus_name, "released bus name");
    } else {
        warn!(bus_name = %names.bus_name, "bus name was not ours to release");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpcm_core::BUS_BASE;

    #[test]
    fn connection_names_escape_components() {
        let (ctx, _bus) = Context::in_memory();
        let names = connection_names(
            &ctx,
            BUS_BASE,
            "gabble",
            "local-xmpp",
            Some("alice@example.com"),
        )
        .unwrap();
        assert_eq!(
            names.bus_name,
            "org.freedesktop.Telepathy.Connection.gabble.local_xmpp.alice_40example_2ecom"
        );
        assert_eq!(
            names.object_path.as_str(),
            "/org/freedesktop/Telepathy/Connection/gabble/local_xmpp/alice_40example_2ecom"
        );
    }

    #[test]
    fn anonymous_connections_count_up() {
        let (ctx, _bus) = Context::in_memory();
        let first = connection_names(&ctx, BUS_BASE, "cm", "irc", None).unwrap();
        let second = connection_names(&ctx, BUS_BASE, "cm", "irc", None).unwrap();
        assert!(first.bus_name.ends_with(".irc._0"));
        assert!(second.bus_name.ends_with(".irc._1"));
    }

    #[test]
    fn manager_names_follow_the_base() {
        let names = manager_names(BUS_BASE, "haze").unwrap();
        assert_eq!(
            names.bus_name,
            "org.freedesktop.Telepathy.ConnectionManager.haze"
        );
        assert_eq!(
            names.object_path.as_str(),
            "/org/freedesktop/Telepathy/ConnectionManager/haze"
        );
        assert!(manager_names(BUS_BASE, "9lives").is_err());
    }

    #[test]
    fn claims_do_not_queue() {
        let (ctx, bus) = Context::in_memory();
        let names = manager_names(BUS_BASE, "haze").unwrap();
        let squatter = bus.connect_client();
        bus.request_name_for(&squatter, &names.bus_name);

        assert!(matches!(
            claim(&ctx, &names),
            Err(TpError::NotAvailable(_))
        ));

        bus.disconnect_client(&squatter);
        claim(&ctx, &names).unwrap();
        assert!(matches!(
            claim(&ctx, &names),
            Err(TpError::NotAvailable(_))
        ));
        release(&ctx, &names);
        assert!(bus.owned_names().is_empty());
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_manager_name("gabble"));
        assert!(is_valid_manager_name("sofia_sip2"));
        assert!(!is_valid_manager_name("_x"));
        assert!(!is_valid_manager_name("a-b"));
        assert!(is_valid_bus_name("org.freedesktop.Telepathy"));
        assert!(!is_valid_bus_name("single"));
        assert!(!is_valid_bus_name("a..b"));
        assert!(!is_valid_bus_name("a.1b"));
    }
}
