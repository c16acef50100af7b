//! Command vocabulary of the vault firmware.
//!
//! Each function builds the [`Command`] envelope for one firmware command.
//! Boolean flags travel as the strings `"true"` / `"false"`, and optional
//! fields are left out of the envelope when absent.

use vaultlink_types::Command;

/// Authenticate the session. Params: `p`.
pub const PASSPHRASE: &str = "passphrase";

/// Type arbitrary text on the host. Params: `text`, `layout?`, `ret`.
pub const TYPE_RAW: &str = "typeRaw";

/// Type a stored password on the host. Params: `id`, `layout?`, `ret`.
pub const TYPE_PASS: &str = "typePass";

/// Fetch a stored entry. Params: `id`.
pub const FETCH_PASS: &str = "fetchPass";

/// Edit a stored entry. Params: `id`, `name?`, `password?`, `layout?`.
pub const EDIT_PASS: &str = "editPass";

/// List stored entries.
pub const LIST: &str = "list";

/// Factory reset.
pub const RESET: &str = "reset";

/// Change the Wi-Fi access point password. Params: `newPass`.
pub const UPDATE_WIFI_PASS: &str = "updateWifiPass";

/// Dump one entry as raw text. Params: `uid`.
pub const DUMP_ONE: &str = "dumpOne";

/// Restore one previously dumped entry. Params: `uid`, `data`.
pub const RESTORE_ONE: &str = "restoreOne";

fn flag(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

pub fn passphrase(secret: &str) -> Command {
    Command::new(PASSPHRASE).with_param("p", secret)
}

/// `ret` controls whether the device presses Return after typing.
pub fn type_raw(text: &str, layout: Option<u32>, ret: bool) -> Command {
    Command::new(TYPE_RAW)
        .with_param("text", text)
        .with_optional("layout", layout)
        .with_param("ret", flag(ret))
}

pub fn type_pass(id: u32, layout: Option<u32>, ret: bool) -> Command {
    Command::new(TYPE_PASS)
        .with_param("id", id)
        .with_optional("layout", layout)
        .with_param("ret", flag(ret))
}

pub fn fetch_pass(id: u32) -> Command {
    Command::new(FETCH_PASS).with_param("id", id)
}

pub fn edit_pass(
    id: u32,
    name: Option<&str>,
    password: Option<&str>,
    layout: Option<u32>,
) -> Command {
    Command::new(EDIT_PASS)
        .with_param("id", id)
        .with_optional("name", name)
        .with_optional("password", password)
        .with_optional("layout", layout)
}

pub fn list() -> Command {
    Command::new(LIST)
}

pub fn reset() -> Command {
    Command::new(RESET)
}

pub fn update_wifi_pass(new_pass: &str) -> Command {
    Command::new(UPDATE_WIFI_PASS).with_param("newPass", new_pass)
}

pub fn dump_one(uid: u32) -> Command {
    Command::new(DUMP_ONE).with_param("uid", uid)
}

pub fn restore_one(uid: u32, data: &str) -> Command {
    Command::new(RESTORE_ONE)
        .with_param("uid", uid)
        .with_param("data", data)
}
