//! Builders for the administrative and subscription commands.
//!
//! | Command | Service | Parameters                                  |
//! |---------|---------|---------------------------------------------|
//! | LOGIN   | ADMIN   | `credential`, `token`, `version`            |
//! | LOGOUT  | ADMIN   | none                                        |
//! | QOS     | ADMIN   | `qoslevel` (`0`..`5`)                       |
//! | SUBS    | any     | `keys` (comma-joined), `fields` (fixed list)|

use tds_core::error::Result;
use tds_core::{Command, Principal, QosLevel, Service};

use crate::proto::OutboundCommand;

/// Field indices requested with every SUBS. The upstream protocol expects this
/// exact enumeration regardless of which fields a subscriber reads.
pub const SUBS_FIELDS: &str = "0,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19,20,21,22,23,24,25,26,27,28,29,30,31,32,33,34,35,36,37,38,39,40,41,42,43,44,45,46,47,49,51,52";

/// Build the URL-encoded `credential` parameter for LOGIN.
///
/// The inner string is a form encoding of the principal's attributes with keys
/// in sorted order; the whole of it is then percent-escaped once more.
pub fn credential(principal: &Principal) -> Result<String> {
    let account = principal.session_account()?;
    let info = &principal.streamer_info;
    let timestamp = info.token_timestamp.timestamp_millis().to_string();

    let mut pairs = [
        ("userid", account.account_id.as_str()),
        ("token", info.token.as_str()),
        ("company", account.company.as_str()),
        ("segment", account.segment.as_str()),
        ("cddomain", account.account_cd_domain_id.as_str()),
        ("usergroup", info.user_group.as_str()),
        ("accesslevel", info.access_level.as_str()),
        ("authorized", "Y"),
        ("timestamp", timestamp.as_str()),
        ("appid", info.app_id.as_str()),
        ("acl", info.acl.as_str()),
    ];
    pairs.sort_by_key(|(k, _)| *k);

    let inner = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    Ok(urlencoding::encode(&inner).into_owned())
}

/// ADMIN/LOGIN with the principal's credential and the protocol version.
pub fn login(principal: &Principal, version: &str) -> Result<OutboundCommand> {
    Ok(OutboundCommand::new(Service::Admin, Command::Login)
        .param("credential", credential(principal)?)
        .param("token", principal.streamer_info.token.as_str())
        .param("version", version))
}

/// ADMIN/LOGOUT. Account and source are added by the session.
pub fn logout() -> OutboundCommand {
    OutboundCommand::new(Service::Admin, Command::Logout)
}

/// ADMIN/QOS selecting the server's minimum update interval.
pub fn qos(level: QosLevel) -> OutboundCommand {
    OutboundCommand::new(Service::Admin, Command::Qos).param("qoslevel", level.wire_value().to_string())
}

/// `<service>`/SUBS for the given symbols.
pub fn subs(service: Service, symbols: &[String]) -> OutboundCommand {
    OutboundCommand::new(service, Command::Subs)
        .param("keys", symbols.join(","))
        .param("fields", SUBS_FIELDS)
}
