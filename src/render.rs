//! Human-readable probe report

use std::fmt::{self, Write};

use crate::probe::{
    AsciiResult, ConnectResult, ProbeEntry, ProbeKind, ProbeOutcome, ProbeReport, ProbeResult,
    QosResult, Restrictions, RetainOutcome, RetainResult, SharedSubscriptionResult,
    SharedVerdict, SizeBoundResult, WildcardCheck, WildcardResult,
};

/// Render every report, one block per protocol version
pub fn render_reports(reports: &[ProbeReport]) -> String {
    let mut out = String::new();
    for report in reports {
        // Writing into a String cannot fail
        let _ = write_report(&mut out, report);
    }
    out
}

pub fn render_report(report: &ProbeReport) -> String {
    render_reports(std::slice::from_ref(report))
}

fn write_report(out: &mut String, report: &ProbeReport) -> fmt::Result {
    write!(out, "{}: ", report.version)?;
    match report.outcome(ProbeKind::Connect) {
        Some(ProbeOutcome::Completed(ProbeResult::Connect(connect))) => {
            writeln!(out, "OK")?;
            if let Some(ref restrictions) = connect.restrictions {
                write_restrictions(out, connect, restrictions)?;
            }
        }
        Some(ProbeOutcome::Failed(failure)) => {
            writeln!(out, "NO ({})", failure.detail)?;
            return Ok(());
        }
        _ => {
            writeln!(out, "NO")?;
            return Ok(());
        }
    }

    for entry in &report.entries {
        if entry.kind != ProbeKind::Connect {
            write_entry(out, entry)?;
        }
    }
    writeln!(out)
}

fn write_restrictions(
    out: &mut String,
    connect: &ConnectResult,
    r: &Restrictions,
) -> fmt::Result {
    writeln!(out, "  - Connect restrictions:")?;
    writeln!(out, "      > Retain: {}", yes_no(r.retain_available))?;
    writeln!(
        out,
        "      > Wildcard subscriptions: {}",
        yes_no(r.wildcard_subscription_available)
    )?;
    writeln!(
        out,
        "      > Shared subscriptions: {}",
        yes_no(r.shared_subscription_available)
    )?;
    writeln!(
        out,
        "      > Subscription identifiers: {}",
        yes_no(r.subscription_identifiers_available)
    )?;
    writeln!(out, "      > Maximum QoS: {}", r.maximum_qos as u8)?;
    writeln!(out, "      > Receive maximum: {}", r.receive_maximum)?;
    match r.maximum_packet_size {
        Some(size) => writeln!(out, "      > Maximum packet size: {} bytes", size)?,
        None => writeln!(out, "      > Maximum packet size: unlimited")?,
    }
    writeln!(out, "      > Topic alias maximum: {}", r.topic_alias_maximum)?;
    match r.session_expiry_interval {
        Some(secs) => writeln!(out, "      > Session expiry interval: {}s", secs)?,
        None => writeln!(out, "      > Session expiry interval: Client-based")?,
    }
    match r.server_keep_alive {
        Some(secs) => writeln!(out, "      > Server keep alive: {}s", secs)?,
        None => writeln!(out, "      > Server keep alive: Client-based")?,
    }
    if let Some(ref id) = r.assigned_client_identifier {
        writeln!(out, "      > Assigned client identifier: {}", id)?;
    }
    if connect.session_present {
        writeln!(out, "      > Session present: yes")?;
    }
    Ok(())
}

fn label(kind: ProbeKind) -> &'static str {
    match kind {
        ProbeKind::Connect => "Connect",
        ProbeKind::TopicLength => "Maximum topic length",
        ProbeKind::Qos0 => "QoS 0",
        ProbeKind::Qos1 => "QoS 1",
        ProbeKind::Qos2 => "QoS 2",
        ProbeKind::Retain => "Retain",
        ProbeKind::Wildcard => "Wildcard subscriptions",
        ProbeKind::SharedSubscription => "Shared subscriptions",
        ProbeKind::PayloadSize => "Payload size",
        ProbeKind::ClientIdLength => "Maximum client id length",
        ProbeKind::AsciiClientId => "Unsupported ASCII chars",
    }
}

fn write_entry(out: &mut String, entry: &ProbeEntry) -> fmt::Result {
    write!(out, "  - {}: ", label(entry.kind))?;
    match entry.outcome {
        ProbeOutcome::Completed(ref result) => write_result(out, result),
        ProbeOutcome::Failed(ref failure) => {
            write!(out, "FAILED ({}: {}", failure.kind, failure.detail)?;
            if let Some(ref attempted) = failure.attempted {
                write!(out, ", attempted {}", attempted)?;
            }
            writeln!(out, ")")
        }
        ProbeOutcome::Skipped => writeln!(out, "SKIPPED"),
        ProbeOutcome::NotAttempted => writeln!(out, "NOT ATTEMPTED"),
    }
}

fn write_result(out: &mut String, result: &ProbeResult) -> fmt::Result {
    match result {
        ProbeResult::Connect(_) => writeln!(out, "OK"),
        ProbeResult::SizeBound(size) => write_size(out, size),
        ProbeResult::Qos(qos) => write_qos(out, qos),
        ProbeResult::Retain(retain) => write_retain(out, retain),
        ProbeResult::Wildcard(wildcard) => write_wildcard(out, wildcard),
        ProbeResult::SharedSubscription(shared) => write_shared(out, shared),
        ProbeResult::AsciiClientId(ascii) => write_ascii(out, ascii),
    }
}

fn write_size(out: &mut String, size: &SizeBoundResult) -> fmt::Result {
    match size.aborted {
        Some(ref abort) => writeln!(
            out,
            ">= {} bytes (search stopped at {}: {})",
            size.bound, abort.attempted, abort.detail
        ),
        None if size.search_exhausted_ceiling => writeln!(out, ">= {} bytes", size.bound),
        None => writeln!(out, "{} bytes", size.bound),
    }
}

fn write_qos(out: &mut String, qos: &QosResult) -> fmt::Result {
    write!(
        out,
        "Received {}/{} publishes in {:.2}ms",
        qos.received,
        qos.requested,
        qos.elapsed_millis()
    )?;
    if qos.granted != qos.qos {
        write!(out, " (granted QoS {})", qos.granted as u8)?;
    }
    writeln!(out)
}

fn write_retain(out: &mut String, retain: &RetainResult) -> fmt::Result {
    match retain.outcome {
        RetainOutcome::Observed => writeln!(out, "OK"),
        RetainOutcome::NotDelivered => writeln!(out, "NO (not delivered to new subscriber)"),
        RetainOutcome::PublishRejected(ref reason) => {
            writeln!(out, "NO (publish rejected: {})", reason)
        }
    }
}

fn write_wildcard(out: &mut String, wildcard: &WildcardResult) -> fmt::Result {
    if wildcard.supported() {
        return writeln!(out, "OK");
    }
    writeln!(out, "NO")?;
    writeln!(out, "      > '+' Wildcard: {}", check_label(&wildcard.plus))?;
    writeln!(out, "      > '#' Wildcard: {}", check_label(&wildcard.hash))
}

fn check_label(check: &WildcardCheck) -> String {
    match check {
        WildcardCheck::Ok => "OK".to_string(),
        WildcardCheck::SubscribeFailed(reason) => format!("subscribe failed ({})", reason),
        WildcardCheck::PublishFailed(reason) => format!("publish failed ({})", reason),
        WildcardCheck::TimedOut => "timed out".to_string(),
    }
}

fn write_shared(out: &mut String, shared: &SharedSubscriptionResult) -> fmt::Result {
    let verdict = match shared.verdict {
        SharedVerdict::Supported => "OK",
        SharedVerdict::Unsupported => "NO",
        SharedVerdict::Indeterminate => "INDETERMINATE",
    };
    match shared.detail {
        Some(ref detail) => writeln!(out, "{} ({})", verdict, detail),
        None => writeln!(out, "{}", verdict),
    }
}

fn write_ascii(out: &mut String, ascii: &AsciiResult) -> fmt::Result {
    if ascii.unsupported.is_empty() {
        return writeln!(out, "ALL SUPPORTED");
    }
    let chars: Vec<String> = ascii
        .unsupported
        .iter()
        .map(|c| format!("'{}'", c))
        .collect();
    writeln!(out, "{{{}}}", chars.join(", "))
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "OK"
    } else {
        "NO"
    }
}
