use console::style;

use crate::keys::cert::{Cert, Validity};
use crate::keys::reconcile::Outcome;
use crate::popup::{ImportPrompt, TrustChange};

/// Print a success message: "ok: <message>"
pub fn ok(message: &str) {
    eprintln!("{} {}", style("ok:").green().bold(), message);
}

/// Print an error message: "error: <message>"
pub fn error(message: &str) {
    eprintln!("{} {}", style("error:").red().bold(), message);
}

/// Print a warning message: "warning: <message>"
pub fn warning(message: &str) {
    eprintln!("{} {}", style("warning:").yellow().bold(), message);
}

/// Print an aligned `label value` line.
pub fn info(label: &str, value: &str) {
    eprintln!("  {:<14}{}", style(label).bold(), value);
}

pub fn validity(v: Validity) -> String {
    match v {
        Validity::Valid => style("valid").green().to_string(),
        Validity::Invalid => style("invalid").red().bold().to_string(),
        Validity::Unknown => style("unknown").yellow().to_string(),
    }
}

/// One line per key for `keys list`.
pub fn key_line(cert: &Cert, is_default: bool) -> String {
    let uids = cert
        .user_ids()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{} {} {:<7} {:<9} {}",
        if is_default { "*" } else { " " },
        cert.fingerprint(),
        if cert.is_private() { "private" } else { "public" },
        validity(cert.validity_at(chrono::Utc::now())),
        uids
    )
}

/// Describe an import confirmation on stderr.
pub fn import_prompt(prompt: &ImportPrompt) {
    match prompt.change {
        TrustChange::NewKey => eprintln!("Importing a new key:"),
        TrustChange::Gaining => eprintln!("Updated key {}:", style("gains trust").green()),
        TrustChange::Losing => eprintln!(
            "Updated key {}:",
            style("LOSES trust and will not be applied").red().bold()
        ),
    }
    info("fingerprint:", prompt.fingerprint.as_str());
    for uid in &prompt.user_ids {
        info("user id:", &uid.to_string());
    }
    let transition = match prompt.before {
        Some(before) => format!("{} -> {}", validity(before), validity(prompt.after)),
        None => validity(prompt.after),
    };
    info("validity:", &transition);
    if let Some(reason) = &prompt.revocation_reason {
        info("revoked:", reason);
    }
    for old in &prompt.replaces {
        info("replaces:", old.as_str());
    }
    eprintln!();
}

pub fn outcome(fingerprint: &str, outcome: Outcome) {
    match outcome {
        Outcome::Imported => ok(&format!("imported key {}", fingerprint)),
        Outcome::Updated => ok(&format!("updated key {}", fingerprint)),
        Outcome::Rejected => warning(&format!("key {} not imported", fingerprint)),
        Outcome::Invalidated => warning(&format!(
            "key {} would become invalid; the stored copy was kept",
            fingerprint
        )),
    }
}
