use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::{
    error::{DispatchError, DispatchResult},
    models::{
        notification::{
            Channel, DirectContent, MessageContent, NotificationRequest, RecipientSpec,
            TemplateContent,
        },
        request::{NotificationCreateRequest, RecipientsBody},
    },
    pipeline::binder,
};

/// Checks a creation body and turns it into a typed request.
///
/// Rules run in a fixed order and the first violation wins:
/// channels, content, senders, recipient variant, direct entries, schedule.
pub fn validate(
    body: &NotificationCreateRequest,
    now: DateTime<Utc>,
) -> DispatchResult<NotificationRequest> {
    let channels = parse_channels(&body.notification_types)?;
    let content = parse_content(body)?;
    let senders = binder::bind(&body.sender_infos, &channels)?;
    let recipients = parse_recipients(&body.recipients)?;

    if let RecipientSpec::DirectRecipients(entries) = &recipients {
        for (index, entry) in entries.iter().enumerate() {
            let usable = channels
                .iter()
                .any(|&channel| entry.address_for(channel).is_some());

            if !usable {
                return Err(invalid(format!(
                    "directRecipients[{}] has no contact field for any of the requested notification types",
                    index
                )));
            }
        }
    }

    if let Some(scheduled_at) = body.scheduled_at
        && scheduled_at <= now
    {
        return Err(invalid(format!(
            "scheduledAt {} must be in the future",
            scheduled_at.to_rfc3339()
        )));
    }

    if body.requester.id.trim().is_empty() {
        return Err(invalid("requester.id must not be blank"));
    }

    Ok(NotificationRequest {
        requester: body.requester.clone(),
        recipients,
        channels,
        senders,
        content,
        scheduled_at: body.scheduled_at,
        memo: body.memo.clone(),
    })
}

fn invalid(reason: impl Into<String>) -> DispatchError {
    DispatchError::Validation(reason.into())
}

fn parse_channels(types: &[String]) -> DispatchResult<BTreeSet<Channel>> {
    if types.is_empty() {
        return Err(invalid("notificationTypes must not be empty"));
    }

    types
        .iter()
        .map(|name| name.parse::<Channel>().map_err(invalid))
        .collect()
}

fn parse_content(body: &NotificationCreateRequest) -> DispatchResult<MessageContent> {
    match (&body.template, &body.content) {
        (Some(_), Some(_)) => Err(invalid("only one of template or content may be set")),
        (None, None) => Err(invalid("one of template or content must be set")),
        (Some(template), None) => {
            let template_id = template.template_id.trim();
            if template_id.is_empty() {
                return Err(invalid("template.templateId must not be blank"));
            }

            Ok(MessageContent::Template(TemplateContent {
                template_id: template_id.to_string(),
                parameters: template.template_parameters.clone(),
            }))
        }
        (None, Some(content)) => {
            if content.body.trim().is_empty() {
                return Err(invalid("content.body must not be blank"));
            }

            Ok(MessageContent::Direct(DirectContent {
                title: content.title.clone(),
                body: content.body.clone(),
                redirect_url: non_blank(&content.redirect_url),
                image_url: non_blank(&content.image_url),
            }))
        }
    }
}

fn parse_recipients(body: &RecipientsBody) -> DispatchResult<RecipientSpec> {
    let mut populated = Vec::new();

    if let Some(user_ids) = body.user_ids.as_ref().filter(|ids| !ids.is_empty()) {
        populated.push(user_ids_spec(user_ids)?);
    }

    if let Some(entries) = body.direct_recipients.as_ref().filter(|e| !e.is_empty()) {
        populated.push(RecipientSpec::DirectRecipients(entries.clone()));
    }

    if let Some(segment) = body.segment.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        populated.push(RecipientSpec::Segment(segment.to_string()));
    }

    if body.all_users == Some(true) {
        populated.push(RecipientSpec::AllUsers);
    }

    match populated.len() {
        1 => Ok(populated.remove(0)),
        0 => Err(invalid(
            "recipients must set one of userIds, directRecipients, segment or allUsers",
        )),
        _ => {
            let kinds: Vec<&str> = populated.iter().map(RecipientSpec::kind).collect();
            Err(invalid(format!(
                "recipients must set exactly one variant, got {}",
                kinds.join(", ")
            )))
        }
    }
}

/// Trims ids and drops repeats, keeping first-seen order.
fn user_ids_spec(user_ids: &[String]) -> DispatchResult<RecipientSpec> {
    let mut seen = BTreeSet::new();
    let mut ordered = Vec::with_capacity(user_ids.len());

    for id in user_ids {
        let id = id.trim();
        if id.is_empty() {
            return Err(invalid("userIds must not contain blank ids"));
        }
        if seen.insert(id) {
            ordered.push(id.to_string());
        }
    }

    Ok(RecipientSpec::UserIds(ordered))
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Duration;

    use super::*;
    use crate::models::{
        notification::{DirectRecipient, Requester, RequesterType},
        request::{ContentBody, SenderInfoBody, TemplateBody},
    };

    fn push_request() -> NotificationCreateRequest {
        NotificationCreateRequest {
            requester: Requester {
                requester_type: RequesterType::User,
                id: "user-sender-789".to_string(),
            },
            recipients: RecipientsBody {
                user_ids: Some(vec!["user-555".to_string()]),
                ..Default::default()
            },
            notification_types: vec!["PUSH".to_string()],
            sender_infos: BTreeMap::from([(
                "PUSH".to_string(),
                SenderInfoBody {
                    sender_name: Some("Shopping App".to_string()),
                    ..Default::default()
                },
            )]),
            template: Some(TemplateBody {
                template_id: "ORDER_SHIPPED".to_string(),
                template_parameters: BTreeMap::from([(
                    "orderId".to_string(),
                    "ORD-20250618-001".to_string(),
                )]),
            }),
            content: None,
            scheduled_at: None,
            memo: None,
        }
    }

    fn content() -> ContentBody {
        ContentBody {
            title: "Notice".to_string(),
            body: "Maintenance tonight".to_string(),
            redirect_url: Some(" ".to_string()),
            image_url: None,
        }
    }

    fn reason(err: DispatchError) -> String {
        match err {
            DispatchError::Validation(reason) => reason,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn accepts_a_well_formed_request() {
        let request = validate(&push_request(), Utc::now()).unwrap();

        assert_eq!(request.channels, BTreeSet::from([Channel::Push]));
        assert_eq!(
            request.recipients,
            RecipientSpec::UserIds(vec!["user-555".to_string()])
        );
        assert!(matches!(request.content, MessageContent::Template(_)));
    }

    #[test]
    fn rejects_empty_or_unknown_channels() {
        let mut body = push_request();
        body.notification_types.clear();
        assert!(reason(validate(&body, Utc::now()).unwrap_err()).contains("notificationTypes"));

        body.notification_types = vec!["PUSH".to_string(), "FAX".to_string()];
        assert!(reason(validate(&body, Utc::now()).unwrap_err()).contains("FAX"));
    }

    #[test]
    fn rejects_both_or_neither_content() {
        let mut body = push_request();
        body.content = Some(content());
        assert!(reason(validate(&body, Utc::now()).unwrap_err()).contains("only one"));

        body.template = None;
        body.content = None;
        assert!(reason(validate(&body, Utc::now()).unwrap_err()).contains("must be set"));
    }

    #[test]
    fn content_rule_fires_before_sender_rule() {
        let mut body = push_request();
        body.sender_infos.clear();
        body.content = Some(content());

        assert!(matches!(
            validate(&body, Utc::now()),
            Err(DispatchError::Validation(_))
        ));
    }

    #[test]
    fn missing_sender_is_reported_per_channel() {
        let mut body = push_request();
        body.notification_types.push("SMS".to_string());

        assert_eq!(
            validate(&body, Utc::now()).unwrap_err(),
            DispatchError::MissingSenderInfo(Channel::Sms)
        );
    }

    #[test]
    fn recipients_need_exactly_one_variant() {
        let mut body = push_request();
        body.recipients.segment = Some("LOYAL_CUSTOMERS".to_string());
        let message = reason(validate(&body, Utc::now()).unwrap_err());
        assert!(message.contains("got userIds, segment"));

        body.recipients = RecipientsBody {
            user_ids: Some(vec![]),
            all_users: Some(false),
            ..Default::default()
        };
        assert!(reason(validate(&body, Utc::now()).unwrap_err()).contains("one of"));
    }

    #[test]
    fn direct_entries_need_a_usable_contact() {
        let mut body = push_request();
        body.notification_types = vec!["EMAIL".to_string(), "PUSH".to_string()];
        body.sender_infos.insert(
            "EMAIL".to_string(),
            SenderInfoBody {
                sender_email_address: Some("no-reply@myproduct.com".to_string()),
                sender_name: Some("My Product".to_string()),
                ..Default::default()
            },
        );
        body.recipients = RecipientsBody {
            direct_recipients: Some(vec![
                DirectRecipient {
                    email: Some("guest@example.com".to_string()),
                    ..Default::default()
                },
                DirectRecipient {
                    phone_number: Some("010-0000-0000".to_string()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        let message = reason(validate(&body, Utc::now()).unwrap_err());
        assert!(message.contains("directRecipients[1]"));
    }

    #[test]
    fn schedule_must_be_strictly_in_the_future() {
        let now = Utc::now();
        let mut body = push_request();

        body.scheduled_at = Some(now - Duration::seconds(1));
        assert!(reason(validate(&body, now).unwrap_err()).contains("scheduledAt"));

        body.scheduled_at = Some(now);
        assert!(validate(&body, now).is_err());

        body.scheduled_at = Some(now + Duration::seconds(1));
        assert_eq!(
            validate(&body, now).unwrap().scheduled_at,
            Some(now + Duration::seconds(1))
        );
    }

    #[test]
    fn user_ids_are_trimmed_and_deduplicated() {
        let mut body = push_request();
        body.recipients.user_ids = Some(vec![
            "u100".to_string(),
            " u101 ".to_string(),
            "u100".to_string(),
        ]);

        let request = validate(&body, Utc::now()).unwrap();
        assert_eq!(
            request.recipients,
            RecipientSpec::UserIds(vec!["u100".to_string(), "u101".to_string()])
        );
    }

    #[test]
    fn blank_redirect_url_is_dropped() {
        let mut body = push_request();
        body.template = None;
        body.content = Some(content());

        match validate(&body, Utc::now()).unwrap().content {
            MessageContent::Direct(direct) => assert_eq!(direct.redirect_url, None),
            other => panic!("unexpected content {:?}", other),
        }
    }
}
