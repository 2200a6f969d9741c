//! mDNS service advertiser (component H, ambient per SPEC_FULL.md §4.H).
//!
//! Publishes the openDAQ streaming endpoint as `_streaming-ws._tcp.local`
//! so clients can discover it without a pre-shared address. The original
//! `openDAQ_discovery.c` registers one PTR, one SRV, one A, and five
//! separate TXT records (each a single `key=value` string) all sharing a
//! TTL of 1200s; `mdns-sd`'s `ServiceInfo` models that TXT set as one
//! record carrying five key/value pairs (the DNS-SD convention — a TXT
//! resource record's RDATA is itself a list of independent strings), which
//! is the same information the original emits as five distinct entries.

use std::collections::HashMap;
use std::net::IpAddr;

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::{debug, info, warn};

use crate::config::Config;

/// TTL the original advertises every record at (§6).
const TTL_SECS: u32 = 1200;

pub struct Advertiser {
    daemon: ServiceDaemon,
    fullname: String,
}

impl Advertiser {
    /// Register the PTR/SRV/A/TXT record set described in SPEC_FULL.md §4.H
    /// and start answering mDNS queries for it.
    pub fn start(config: &Config, device_ip: IpAddr) -> anyhow::Result<Self> {
        let daemon = ServiceDaemon::new()?;

        let service_type = "_streaming-ws._tcp.local.";
        let host_name = format!("{}.local.", config.device_name);

        let mut properties = HashMap::new();
        properties.insert("path".to_string(), config.websocket_uri.clone());
        properties.insert("caps".to_string(), "WS".to_string());
        properties.insert("name".to_string(), config.device_name.clone());
        properties.insert("model".to_string(), config.model_name.clone());
        properties.insert("serialNumber".to_string(), config.serial_number.clone());

        let mut service_info = ServiceInfo::new(
            service_type,
            &config.device_name,
            &host_name,
            device_ip,
            80,
            Some(properties),
        )?
        .enable_addr_auto();
        service_info = service_info.set_host_ttl(TTL_SECS);
        service_info = service_info.set_other_ttl(TTL_SECS);

        let fullname = service_info.get_fullname().to_string();
        daemon.register(service_info)?;

        info!(
            device_name = %config.device_name,
            %device_ip,
            ws_uri = %config.websocket_uri,
            "mDNS service advertised"
        );

        Ok(Self { daemon, fullname })
    }

    /// Deregister and shut the responder down (called on application
    /// shutdown, mirroring `openDAQ_discovery_stop`).
    pub fn stop(self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            debug!(error = %e, "mDNS unregister failed");
        }
        if let Err(e) = self.daemon.shutdown() {
            warn!(error = %e, "mDNS daemon shutdown failed");
        }
    }
}
