//! Lookup of attested service announcements.

use std::collections::HashMap;

use tracing::debug;

use crate::{
    error::{Error, Result},
    event::{now, Event},
    fanout::FanoutQuery,
    filter::Filter,
    kinds::{KIND_ANNOUNCEMENT, KIND_ENCLAVED_PROCESS},
};

/// How far back announcements are considered fresh.
pub const ANNOUNCEMENT_WINDOW: u64 = 3 * 60 * 60;

/// Repository that keycrux announcements point at through an `r` tag.
pub const KEYCRUX_REPO: &str = "https://github.com/nostrband/keycrux";

/// Which family of announcements to look up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcements {
    pub kind: u32,
    /// Required `r` tag value, if any.
    pub repo: Option<String>,
}

impl Announcements {
    /// Any attested enclave.
    pub fn enclaves() -> Self {
        Self {
            kind: KIND_ANNOUNCEMENT,
            repo: None,
        }
    }

    /// Enclaves running the keycrux key custody service.
    pub fn keycrux() -> Self {
        Self {
            kind: KIND_ANNOUNCEMENT,
            repo: Some(KEYCRUX_REPO.to_string()),
        }
    }

    /// Processes running inside an enclave.
    pub fn containers() -> Self {
        Self {
            kind: KIND_ENCLAVED_PROCESS,
            repo: None,
        }
    }

    fn filter(&self) -> Filter {
        let mut filter = Filter::new()
            .kinds([self.kind])
            .since(now().saturating_sub(ANNOUNCEMENT_WINDOW));
        if let Some(repo) = &self.repo {
            filter = filter.tag('r', [repo.as_str()]);
        }
        filter
    }
}

/// Decides whether an announcement's attestation holds.
pub trait Validator: Send + Sync {
    fn validate(&self, record: &Event) -> bool;
}

impl<F> Validator for F
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    fn validate(&self, record: &Event) -> bool {
        self(record)
    }
}

/// Newest valid record per author, in order of first appearance.
///
/// Records older than an author's kept record are skipped without being
/// validated. A valid record with the same timestamp replaces the kept one.
pub fn latest_valid_per_author(records: Vec<Event>, validator: &dyn Validator) -> Vec<Event> {
    let mut slot: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Event> = Vec::new();
    for ev in records {
        let existing = slot.get(&ev.pubkey).copied();
        if existing.is_some_and(|i| out[i].created_at > ev.created_at) {
            continue;
        }
        if !validator.validate(&ev) {
            debug!(id = %ev.id, author = %ev.pubkey, "announcement failed validation");
            continue;
        }
        match existing {
            Some(i) => out[i] = ev,
            None => {
                slot.insert(ev.pubkey.clone(), out.len());
                out.push(ev);
            }
        }
    }
    out
}

/// Recent announcements, optionally only those tagging `pubkey`.
pub async fn fetch_services<S: AsRef<str>>(
    query: &FanoutQuery,
    family: &Announcements,
    pubkey: Option<&str>,
    relays: &[S],
    validator: &dyn Validator,
) -> Result<Vec<Event>> {
    let mut filter = family.filter();
    if let Some(pk) = pubkey {
        filter = filter.tag('p', [pk]);
    }
    let records = query.fetch(&filter, relays).await?;
    Ok(latest_valid_per_author(records, validator))
}

/// Announcement of one service. `Ok(None)` when it has none on the relays.
pub async fn fetch_service<S: AsRef<str>>(
    query: &FanoutQuery,
    family: &Announcements,
    pubkey: &str,
    relays: &[S],
    validator: &dyn Validator,
) -> Result<Option<Event>> {
    let filter = family.filter().authors([pubkey]);
    let Some(record) = query.fetch(&filter, relays).await?.into_iter().next() else {
        return Ok(None);
    };
    if !validator.validate(&record) {
        return Err(Error::protocol(format!("invalid announcement {}", record.id)));
    }
    Ok(Some(record))
}
