//! Structured audit records for control outcomes and denies.
//!
//! A thin facade over the host logger: every record is a single line under
//! the `audit` target so operators can route them independently of the
//! service log.

use std::net::IpAddr;

pub struct ControlAudit<'a> {
    pub client_id: &'a str,
    pub entity_id: &'a str,
    pub service: &'a str,
    pub result: &'a str,
    pub actor_user_id: Option<&'a str>,
    pub actor_role: Option<&'a str>,
    pub source_ip: IpAddr,
    pub reason: Option<&'a str>,
}

pub fn log_control(record: ControlAudit<'_>) {
    info!(
        target: "audit",
        client_id = record.client_id,
        entity_id = record.entity_id,
        service = record.service,
        result = record.result,
        actor_user_id = record.actor_user_id,
        actor_role = record.actor_role,
        source_ip = %record.source_ip,
        reason = record.reason,
        "control",
    );
}

pub fn log_deny(client_id: Option<&str>, source_ip: IpAddr, path: &str, reason: &'static str) {
    info!(
        target: "audit",
        client_id,
        source_ip = %source_ip,
        path,
        reason,
        result = "denied",
        "deny",
    );
}

pub fn log_push(result: &str, batch_len: usize, attempts: u32, reason: Option<&str>) {
    info!(
        target: "audit",
        service = "push",
        result,
        batch_len,
        attempts,
        reason,
        "push",
    );
}
