//! Scanners for the XML fragments the SMS gateway embeds in SNAC bodies.
//!
//! The gateway speaks a fixed, flat vocabulary (`<sms_message>`,
//! `<sms_delivery_receipt>`, `<sms_response>`); this is a tag scanner for
//! exactly those fragments, not a general XML engine.

use winnow::error::ContextError;
use winnow::prelude::*;
use winnow::token::{literal, take_until};

use super::error::{Error, Result};

/// Inbound SMS message fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmsMessage {
    pub text: String,
    pub source: String,
    pub sender: String,
    pub senders_network: String,
    pub time: String,
}

/// Inbound SMS delivery receipt fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmsReceipt {
    pub message_id: String,
    pub destination: String,
    pub delivered: bool,
    pub text: String,
    /// Spelled `submition_time` on the wire; the API uses the real word.
    pub submission_time: String,
    pub delivery_time: String,
}

/// Gateway response to an outbound SMS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmsResponse {
    pub source: String,
    pub deliverable: bool,
    pub network: String,
    pub message_id: String,
    pub messages_left: String,
    pub error_id: Option<u32>,
    pub error_param: String,
}

/// Name of the outermost tag, or None for non-XML input.
pub fn root_tag(doc: &str) -> Option<&str> {
    let mut input = doc;
    let _: &str = take_until::<_, _, ContextError>(0.., "<").parse_next(&mut input).ok()?;
    let _: &str = literal::<_, _, ContextError>("<").parse_next(&mut input).ok()?;
    let tag: &str = take_until::<_, _, ContextError>(0.., ">").parse_next(&mut input).ok()?;
    Some(tag)
}

/// Text of the first `<tag>...</tag>` leaf, entities unescaped.
pub fn leaf(doc: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut input = doc;
    let _: &str = take_until::<_, _, ContextError>(0.., open.as_str())
        .parse_next(&mut input)
        .ok()?;
    let _: &str = literal::<_, _, ContextError>(open.as_str())
        .parse_next(&mut input)
        .ok()?;
    let body: &str = take_until::<_, _, ContextError>(0.., close.as_str())
        .parse_next(&mut input)
        .ok()?;
    Some(unescape(body))
}

fn leaf_or_default(doc: &str, tag: &str) -> String {
    leaf(doc, tag).unwrap_or_default()
}

/// Parse an `<sms_message>` fragment.
pub fn parse_sms_message(doc: &str) -> Result<SmsMessage> {
    if root_tag(doc) != Some("sms_message") {
        return Err(Error::parse("no <sms_message> tag in SMS data"));
    }
    let text = leaf(doc, "text").ok_or_else(|| Error::parse("no <text> tag in SMS data"))?;
    Ok(SmsMessage {
        text,
        source: leaf_or_default(doc, "source"),
        sender: leaf_or_default(doc, "sender"),
        senders_network: leaf_or_default(doc, "senders_network"),
        time: leaf_or_default(doc, "time"),
    })
}

/// Parse an `<sms_delivery_receipt>` fragment.
pub fn parse_sms_receipt(doc: &str) -> Result<SmsReceipt> {
    if root_tag(doc) != Some("sms_delivery_receipt") {
        return Err(Error::parse("no <sms_delivery_receipt> tag in SMS data"));
    }
    Ok(SmsReceipt {
        message_id: leaf_or_default(doc, "message_id"),
        destination: leaf_or_default(doc, "destination"),
        delivered: leaf(doc, "delivered").as_deref() == Some("Yes"),
        text: leaf_or_default(doc, "text"),
        // the gateway never learned to spell
        submission_time: leaf_or_default(doc, "submition_time"),
        delivery_time: leaf_or_default(doc, "delivery_time"),
    })
}

/// Parse an `<sms_response>` fragment.
pub fn parse_sms_response(doc: &str) -> Result<SmsResponse> {
    if root_tag(doc) != Some("sms_response") {
        return Err(Error::parse("no <sms_response> tag in SMS data"));
    }
    let deliverable = leaf(doc, "deliverable").as_deref() == Some("Yes");
    let (error_id, error_param) = if deliverable {
        (None, String::new())
    } else {
        (
            leaf(doc, "id").and_then(|v| v.trim().parse().ok()),
            leaf_or_default(doc, "param"),
        )
    };
    Ok(SmsResponse {
        source: leaf_or_default(doc, "source"),
        deliverable,
        network: leaf_or_default(doc, "network"),
        message_id: leaf_or_default(doc, "message_id"),
        messages_left: leaf_or_default(doc, "messages_left"),
        error_id,
        error_param,
    })
}

/// Build the `<icq_sms_message>` document for an outbound SMS.
pub fn build_sms_message(
    destination: &str,
    text: &str,
    senders_uin: u32,
    senders_name: &str,
    delivery_receipt: bool,
    time: &str,
) -> String {
    let mut doc = String::from("<icq_sms_message>");
    push_leaf(&mut doc, "destination", destination);
    push_leaf(&mut doc, "text", text);
    push_leaf(&mut doc, "codepage", "1252");
    push_leaf(&mut doc, "senders_UIN", &senders_uin.to_string());
    push_leaf(&mut doc, "senders_name", senders_name);
    push_leaf(&mut doc, "delivery_receipt", if delivery_receipt { "Yes" } else { "No" });
    push_leaf(&mut doc, "time", time);
    doc.push_str("</icq_sms_message>");
    doc
}

fn push_leaf(doc: &mut String, tag: &str, value: &str) {
    doc.push('<');
    doc.push_str(tag);
    doc.push('>');
    doc.push_str(&escape(value));
    doc.push_str("</");
    doc.push_str(tag);
    doc.push('>');
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<").replace("&gt;", ">").replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sms_message() {
        let doc = "<sms_message><text>hi there</text><source>ICQ</source>\
                   <sender>+441234567890</sender><senders_network></senders_network>\
                   <time>Sat, 01 Dec 2001 10:00:00 GMT</time></sms_message>";
        let sms = parse_sms_message(doc).unwrap();
        assert_eq!(sms.text, "hi there");
        assert_eq!(sms.sender, "+441234567890");
        assert_eq!(sms.senders_network, "");
        assert!(parse_sms_message("<other/>").is_err());
    }

    #[test]
    fn test_sms_receipt_misspelled_tag() {
        let doc = "<sms_delivery_receipt><message_id>42</message_id>\
                   <destination>+44123</destination><delivered>Yes</delivered>\
                   <submition_time>t1</submition_time><delivery_time>t2</delivery_time>\
                   </sms_delivery_receipt>";
        let r = parse_sms_receipt(doc).unwrap();
        assert!(r.delivered);
        assert_eq!(r.message_id, "42");
        assert_eq!(r.submission_time, "t1");
    }

    #[test]
    fn test_sms_response_error() {
        let doc = "<sms_response><source>ICQ</source><deliverable>No</deliverable>\
                   <error><id>8</id><params><param>DUPLEX RESPONSE</param></params></error>\
                   </sms_response>";
        let r = parse_sms_response(doc).unwrap();
        assert!(!r.deliverable);
        assert_eq!(r.error_id, Some(8));
        assert_eq!(r.error_param, "DUPLEX RESPONSE");
    }

    #[test]
    fn test_build_escapes_entities() {
        let doc = build_sms_message("+44123", "a<b & c", 1234, "me", false, "now");
        assert!(doc.contains("<text>a&lt;b &amp; c</text>"));
        assert_eq!(leaf(&doc, "text").unwrap(), "a<b & c");
        assert_eq!(leaf(&doc, "delivery_receipt").unwrap(), "No");
    }
}
