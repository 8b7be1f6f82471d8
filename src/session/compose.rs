//! Outbound message preparation: default addresses, client signature, and
//! origination-IP stamping.

use std::net::IpAddr;

use mail_parser::{Address, MessageParser};

use crate::error::{ChainmailError, Result};
use crate::model::account::MailAccount;
use crate::model::address::EmailAddress;
use crate::parser::header::{field_name, get_header, raw_fields, split_message, unfold_headers};

use super::client::OutboundMessage;

/// Header carrying the client signature.
pub const SIGNATURE_HEADER: &str = "X-Mailer";

/// Plausible desktop and webmail client identifiers.
pub const CLIENT_SIGNATURES: &[&str] = &[
    "Microsoft Outlook 16.0",
    "Mozilla Thunderbird 115.6.0",
    "Apple Mail (2.3774.300.61.1.2)",
    "Microsoft Windows Live Mail 16.4.3528.331",
    "The Bat! (v10.5.3) Professional",
    "Evolution 3.50.2",
    "Claws Mail 4.2.0 (GTK 3.24.41; x86_64-pc-linux-gnu)",
    "eM Client 9.2.2157.0",
];

/// Header names used for the origination IP, picked by the same index as
/// the signature.
pub const ORIGIN_HEADERS: &[&str] = &[
    "X-Originating-IP",
    "X-Sender-IP",
    "X-Source-IP",
    "X-Client-IP",
];

/// Rewrite a queued message for submission and derive its envelope.
///
/// `pick` selects the signature and origin header name (taken modulo each
/// table). `origin_ip` is stamped when given. `Bcc` is removed from the
/// transmitted copy but its addresses stay in the envelope.
pub fn compose(
    raw: &[u8],
    account: &MailAccount,
    origin_ip: Option<IpAddr>,
    pick: usize,
) -> Result<OutboundMessage> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| ChainmailError::InvalidMessage("unparseable message".into()))?;

    let mut recipients = Vec::new();
    for list in [parsed.to(), parsed.cc(), parsed.bcc()] {
        collect_addresses(&mut recipients, list);
    }
    if recipients.is_empty() {
        return Err(ChainmailError::InvalidMessage("no recipients".into()));
    }
    let from = parsed
        .from()
        .and_then(|list| list.iter().find_map(|a| a.address()))
        .map(str::to_string)
        .unwrap_or_else(|| account.address());

    let (head, body) = split_message(raw);
    let head = String::from_utf8_lossy(head);
    let eol = if head.contains("\r\n") { "\r\n" } else { "\n" };
    let present = unfold_headers(&head);
    let has = |name: &str| get_header(&present, name).is_some_and(|v| !v.trim().is_empty());

    let origin_name = ORIGIN_HEADERS[pick % ORIGIN_HEADERS.len()];
    let signature = CLIENT_SIGNATURES[pick % CLIENT_SIGNATURES.len()];

    let mut out = String::with_capacity(head.len() + 256);
    for field in raw_fields(&head) {
        let drop = field_name(&field).is_some_and(|name| {
            name.eq_ignore_ascii_case(SIGNATURE_HEADER)
                || name.eq_ignore_ascii_case("bcc")
                || (origin_ip.is_some() && name.eq_ignore_ascii_case(origin_name))
        });
        if drop {
            continue;
        }
        out.push_str(&field);
        if !field.ends_with('\n') {
            out.push_str(eol);
        }
    }

    if !has("from") {
        out.push_str(&format!("From: {}{eol}", account.sender().header_value()));
    }
    if !has("reply-to") {
        let reply_to = account
            .reply_to
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .map(EmailAddress::parse)
            .unwrap_or_else(|| account.sender());
        out.push_str(&format!("Reply-To: {}{eol}", reply_to.header_value()));
    }
    out.push_str(&format!("{SIGNATURE_HEADER}: {signature}{eol}"));
    if let Some(ip) = origin_ip {
        out.push_str(&format!("{origin_name}: [{ip}]{eol}"));
    }

    let mut message = out.into_bytes();
    message.extend_from_slice(eol.as_bytes());
    message.extend_from_slice(body);

    Ok(OutboundMessage {
        from,
        recipients,
        raw: message,
    })
}

fn collect_addresses(out: &mut Vec<String>, list: Option<&Address<'_>>) {
    let Some(list) = list else {
        return;
    };
    for addr in list.iter() {
        let Some(address) = addr.address().map(str::trim).filter(|a| !a.is_empty()) else {
            continue;
        };
        if !out.iter().any(|known| known.eq_ignore_ascii_case(address)) {
            out.push(address.to_string());
        }
    }
}
