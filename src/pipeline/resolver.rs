use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::Arc,
    time::Duration,
};

use futures_util::{Stream, stream};
use tracing::{debug, info, warn};

use crate::{
    error::{DispatchError, DispatchResult},
    models::{
        notification::{Channel, DirectRecipient, RecipientSpec},
        recipient::{Audience, ResolvedRecipient},
    },
    ports::ContactDirectory,
    utils::bounded,
};

pub type ResolvedAudiences = BTreeMap<Channel, Audience>;

/// Turns a recipient spec into per-channel address sets.
pub struct RecipientResolver {
    directory: Arc<dyn ContactDirectory>,
    lookup_timeout: Duration,
}

impl RecipientResolver {
    pub fn new(directory: Arc<dyn ContactDirectory>, lookup_timeout: Duration) -> Self {
        Self {
            directory,
            lookup_timeout,
        }
    }

    pub async fn resolve(
        &self,
        spec: &RecipientSpec,
        channels: &BTreeSet<Channel>,
    ) -> DispatchResult<ResolvedAudiences> {
        let audiences = match spec {
            RecipientSpec::UserIds(user_ids) => self.resolve_users(user_ids, channels).await?,
            RecipientSpec::DirectRecipients(entries) => resolve_direct(entries, channels),
            RecipientSpec::Segment(name) => {
                let members = bounded(
                    self.lookup_timeout,
                    "segment lookup",
                    self.directory.resolve_segment(name),
                )
                .await
                .map_err(resolution_error)?
                .ok_or_else(|| {
                    DispatchError::Resolution(format!("unknown segment '{}'", name))
                })?;

                info!(segment = %name, members = members.len(), "Segment resolved");
                self.resolve_users(&members, channels).await?
            }
            RecipientSpec::AllUsers => channels
                .iter()
                .map(|&channel| (channel, Audience::Broadcast))
                .collect(),
        };

        Ok(audiences)
    }

    async fn resolve_users(
        &self,
        user_ids: &[String],
        channels: &BTreeSet<Channel>,
    ) -> DispatchResult<ResolvedAudiences> {
        let mut audiences: BTreeMap<Channel, AddressSet> = channels
            .iter()
            .map(|&channel| (channel, AddressSet::default()))
            .collect();

        if user_ids.is_empty() {
            return Ok(finish(audiences));
        }

        let contacts = bounded(
            self.lookup_timeout,
            "contact lookup",
            self.directory.lookup_contacts(user_ids, channels),
        )
        .await
        .map_err(resolution_error)?;

        for user_id in user_ids {
            let user_contacts = contacts.get(user_id);

            let language = user_contacts.and_then(|c| c.language.as_deref());

            for (&channel, set) in audiences.iter_mut() {
                match user_contacts.and_then(|c| c.address_for(channel)) {
                    Some(address) => {
                        set.push(ResolvedRecipient::user(user_id, address).with_language(language))
                    }
                    None => warn!(
                        user_id = %user_id,
                        channel = %channel,
                        "User has no contact address for channel, skipping"
                    ),
                }
            }
        }

        Ok(finish(audiences))
    }

    /// Pages through the whole user base for one channel.
    ///
    /// Each item is one page of recipients not seen earlier. Repeats within a
    /// page are always dropped. Across pages at most `dedup_capacity`
    /// addresses are remembered; past that, only the directory's own
    /// uniqueness holds. The stream ends after the page without a next cursor, and
    /// yields an error (then ends) if a page cannot be fetched.
    pub fn broadcast_pages(
        &self,
        channel: Channel,
        page_size: usize,
        dedup_capacity: usize,
    ) -> impl Stream<Item = DispatchResult<Vec<ResolvedRecipient>>> + Send + use<> {
        let state = BroadcastCursor {
            directory: Arc::clone(&self.directory),
            lookup_timeout: self.lookup_timeout,
            channel,
            page_size,
            cursor: None,
            seen: HashSet::new(),
            dedup_capacity,
            saturated: false,
            done: false,
        };

        stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }

            let page = bounded(
                state.lookup_timeout,
                "broadcast page",
                state
                    .directory
                    .list_all_users(state.channel, state.cursor.as_deref(), state.page_size),
            )
            .await;

            match page {
                Ok(page) => {
                    state.cursor = page.next_cursor.filter(|c| !c.is_empty());
                    state.done = state.cursor.is_none();

                    let mut in_page = HashSet::new();
                    let recipients: Vec<ResolvedRecipient> = page
                        .contacts
                        .into_iter()
                        .filter(|contact| !contact.address.trim().is_empty())
                        .filter(|contact| state.first_sighting(&contact.address))
                        .filter(|contact| in_page.insert(contact.address.clone()))
                        .map(|contact| {
                            ResolvedRecipient::user(contact.user_id, contact.address)
                                .with_language(contact.language.as_deref())
                        })
                        .collect();

                    debug!(
                        channel = %state.channel,
                        page_len = recipients.len(),
                        more = !state.done,
                        "Broadcast page fetched"
                    );

                    Some((Ok(recipients), state))
                }
                Err(e) => {
                    state.done = true;
                    Some((Err(resolution_error(e)), state))
                }
            }
        })
    }
}

struct BroadcastCursor {
    directory: Arc<dyn ContactDirectory>,
    lookup_timeout: Duration,
    channel: Channel,
    page_size: usize,
    cursor: Option<String>,
    seen: HashSet<String>,
    dedup_capacity: usize,
    saturated: bool,
    done: bool,
}

impl BroadcastCursor {
    /// False only for an address already delivered on an earlier page.
    fn first_sighting(&mut self, address: &str) -> bool {
        if self.seen.contains(address) {
            return false;
        }

        if self.seen.len() < self.dedup_capacity {
            self.seen.insert(address.to_string());
        } else if !self.saturated {
            self.saturated = true;
            warn!(
                channel = %self.channel,
                dedup_capacity = self.dedup_capacity,
                "Broadcast dedup capacity reached, later pages rely on directory uniqueness"
            );
        }

        true
    }
}

/// Insertion-ordered recipients, unique by address.
#[derive(Default)]
struct AddressSet {
    seen: HashSet<String>,
    recipients: Vec<ResolvedRecipient>,
}

impl AddressSet {
    fn push(&mut self, recipient: ResolvedRecipient) {
        if self.seen.insert(recipient.address.clone()) {
            self.recipients.push(recipient);
        }
    }
}

fn finish(audiences: BTreeMap<Channel, AddressSet>) -> ResolvedAudiences {
    audiences
        .into_iter()
        .map(|(channel, set)| (channel, Audience::Listed(set.recipients)))
        .collect()
}

fn resolve_direct(entries: &[DirectRecipient], channels: &BTreeSet<Channel>) -> ResolvedAudiences {
    let mut audiences: BTreeMap<Channel, AddressSet> = channels
        .iter()
        .map(|&channel| (channel, AddressSet::default()))
        .collect();

    for entry in entries {
        for (&channel, set) in audiences.iter_mut() {
            if let Some(address) = entry.address_for(channel) {
                set.push(ResolvedRecipient::direct(address));
            }
        }
    }

    finish(audiences)
}

fn resolution_error(err: anyhow::Error) -> DispatchError {
    DispatchError::Resolution(format!("{:#}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_token_only_entries_reach_push_only() {
        let entries = vec![
            DirectRecipient {
                device_token: Some("guest-device-token-xyz".to_string()),
                ..Default::default()
            },
            DirectRecipient {
                email: Some("guest@example.com".to_string()),
                ..Default::default()
            },
        ];
        let channels = BTreeSet::from([Channel::Email, Channel::Sms, Channel::Push]);

        let audiences = resolve_direct(&entries, &channels);

        assert_eq!(
            audiences[&Channel::Push],
            Audience::Listed(vec![ResolvedRecipient::direct("guest-device-token-xyz")])
        );
        assert_eq!(
            audiences[&Channel::Email],
            Audience::Listed(vec![ResolvedRecipient::direct("guest@example.com")])
        );
        assert_eq!(audiences[&Channel::Sms], Audience::Listed(vec![]));
    }

    #[test]
    fn identical_direct_addresses_collapse() {
        let entry = DirectRecipient {
            email: Some("guest@example.com".to_string()),
            ..Default::default()
        };
        let audiences = resolve_direct(&[entry.clone(), entry], &BTreeSet::from([Channel::Email]));

        assert_eq!(audiences[&Channel::Email].listed_len(), Some(1));
    }
}
