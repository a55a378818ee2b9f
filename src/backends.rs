//! Access backend registration and dispatch
//!
//! Backends are selected with a programmer-style string: `name` or
//! `name:key=value,key=value`.

use std::collections::HashMap;

use asmtool_core::PciAccess;

/// Information about a backend
pub struct BackendInfo {
    /// Primary name (used for matching)
    pub name: &'static str,
    /// Alternative names
    pub aliases: &'static [&'static str],
    /// Short description
    pub description: &'static str,
    /// Whether the backend needs root
    pub requires_root: bool,
}

/// Backends compiled into this binary
pub fn available_backends() -> Vec<BackendInfo> {
    let mut backends = Vec::new();

    #[cfg(all(feature = "linux", target_os = "linux"))]
    backends.push(BackendInfo {
        name: "linux",
        aliases: &["sysfs"],
        description: "sysfs PCI config space and /dev/mem (domain=<hex>,sysfs=<path>)",
        requires_root: true,
    });

    backends.push(BackendInfo {
        name: "dummy",
        aliases: &["sim"],
        description: "Simulated controller (chip=<2142|3142>,generation=<legacy|revised>,flash=<file>,mem_size=<n>,fail_flash_read=<n>,bus=,dev=,func=)",
        requires_root: false,
    });

    backends
}

/// Print the backend list
pub fn list_backends() {
    println!("Available backends:");
    println!();
    for b in available_backends() {
        let root = if b.requires_root { " [root]" } else { "" };
        println!("  {:8} - {}{}", b.name, b.description, root);
    }
}

/// Parsed backend string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendParams {
    pub name: String,
    pub params: HashMap<String, String>,
}

impl BackendParams {
    /// Options as borrowed key/value pairs, in a stable order
    pub fn options(&self) -> Vec<(&str, &str)> {
        let mut opts: Vec<(&str, &str)> = self
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        opts.sort();
        opts
    }
}

/// Parse a backend string like `dummy:chip=3142,mem_size=0x800`
pub fn parse_backend_params(s: &str) -> Result<BackendParams, Box<dyn std::error::Error>> {
    let (name, opts_str) = s.split_once(':').unwrap_or((s, ""));

    let mut params = HashMap::new();
    if !opts_str.is_empty() {
        for opt in opts_str.split(',') {
            if let Some((key, value)) = opt.split_once('=') {
                params.insert(key.to_string(), value.to_string());
            } else {
                return Err(
                    format!("Invalid parameter format: '{}' (expected key=value)", opt).into(),
                );
            }
        }
    }

    Ok(BackendParams {
        name: name.to_string(),
        params,
    })
}

fn resolve(name: &str) -> Option<&'static str> {
    available_backends()
        .into_iter()
        .find(|b| b.name == name || b.aliases.iter().any(|a| *a == name))
        .map(|b| b.name)
}

/// Open the backend named by `backend`
pub fn open_backend(backend: &str) -> Result<Box<dyn PciAccess>, Box<dyn std::error::Error>> {
    let params = parse_backend_params(backend)?;
    let options = params.options();

    let name = resolve(&params.name).ok_or_else(|| {
        format!(
            "Unknown backend '{}'. Use 'list_backends' to see what is available.",
            params.name
        )
    })?;
    log::debug!("Opening backend {} with {:?}", name, options);

    match name {
        #[cfg(all(feature = "linux", target_os = "linux"))]
        "linux" => asmtool_linux::open_linux(&options),
        "dummy" => {
            let config = asmtool_dummy::DummyConfig::from_options(&options)?;
            Ok(Box::new(asmtool_dummy::DummyBus::new(config)))
        }
        other => Err(format!("Backend '{}' is not available on this platform", other).into()),
    }
}
