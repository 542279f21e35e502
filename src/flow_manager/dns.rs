use super::*;
use crate::dns::DnsMapping;

impl FlowManager {
    pub(super) fn emit_dns_mapping(&self, callbacks: BridgeCallbacks, mapping: &DnsMapping) {
        if mapping.addresses.is_empty() {
            return;
        }
        let ttl = mapping.ttl.unwrap_or(60).min(u32::MAX);
        let c_host = match CString::new(mapping.host.as_str()) {
            Ok(value) => value,
            Err(_) => return,
        };
        let mut c_addresses: Vec<CString> = Vec::with_capacity(mapping.addresses.len());
        let mut ptrs: Vec<*const i8> = Vec::with_capacity(mapping.addresses.len());
        for addr in &mapping.addresses {
            let addr_text = addr.to_string();
            if let Ok(c_string) = CString::new(addr_text.as_str()) {
                ptrs.push(c_string.as_ptr());
                c_addresses.push(c_string);
            }
        }
        if ptrs.is_empty() {
            return;
        }
        unsafe {
            (callbacks.record_dns)(
                c_host.as_ptr(),
                ptrs.as_ptr(),
                ptrs.len(),
                ttl,
                callbacks.context,
            );
        }
        logger::breadcrumb(
            BreadcrumbFlags::DNS,
            format!(
                "DNS {} -> {:?} (ttl {}s)",
                mapping.host,
                mapping
                    .addresses
                    .iter()
                    .map(|ip| ip.to_string())
                    .collect::<Vec<_>>(),
                ttl
            ),
        );
    }
}
