use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::{DispatchError, DispatchResult},
    models::{
        notification::{Channel, SenderIdentity},
        request::SenderInfoBody,
    },
};

/// Pairs every requested channel with a sender identity of the right shape.
///
/// Sender infos for channels that were not requested are ignored.
pub fn bind(
    sender_infos: &BTreeMap<String, SenderInfoBody>,
    channels: &BTreeSet<Channel>,
) -> DispatchResult<BTreeMap<Channel, SenderIdentity>> {
    let by_channel: BTreeMap<Channel, &SenderInfoBody> = sender_infos
        .iter()
        .filter_map(|(name, body)| name.parse::<Channel>().ok().map(|channel| (channel, body)))
        .collect();

    channels
        .iter()
        .map(|&channel| {
            let identity = by_channel
                .get(&channel)
                .and_then(|body| identity_for(channel, body))
                .ok_or(DispatchError::MissingSenderInfo(channel))?;

            Ok((channel, identity))
        })
        .collect()
}

fn identity_for(channel: Channel, body: &SenderInfoBody) -> Option<SenderIdentity> {
    let sender_name = present(&body.sender_name)?;

    match channel {
        Channel::Email => Some(SenderIdentity::Email {
            sender_email_address: present(&body.sender_email_address)?,
            sender_name,
        }),
        Channel::Sms => Some(SenderIdentity::Sms {
            sender_phone_number: present(&body.sender_phone_number)?,
            sender_name,
        }),
        Channel::Push => Some(SenderIdentity::Push { sender_name }),
    }
}

fn present(field: &Option<String>) -> Option<String> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
