//! Capability parsing and negotiation for git protocol.
//!
//! Git servers advertise capabilities in the first line of ref advertisement.
//! In v1, capabilities are appended after a NUL byte on the first ref line.
//! In v2, capabilities are sent as a separate section.

/// Parsed set of server capabilities.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    /// Raw capability strings.
    entries: Vec<CapabilityEntry>,
}

/// A single capability, optionally with a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityEntry {
    pub name: String,
    pub value: Option<String>,
}

impl Capabilities {
    /// Parse capabilities from a NUL-separated capability string (v1 format).
    ///
    /// In v1, the first ref line looks like:
    /// `<oid> HEAD\0multi_ack thin-pack side-band-64k ofs-delta symref=HEAD:refs/heads/main agent=git/2.39.0`
    pub fn parse_v1(caps_str: &str) -> Self {
        let mut entries = Vec::new();
        for cap in caps_str.split_whitespace() {
            if let Some(eq_pos) = cap.find('=') {
                entries.push(CapabilityEntry {
                    name: cap[..eq_pos].to_string(),
                    value: Some(cap[eq_pos + 1..].to_string()),
                });
            } else {
                entries.push(CapabilityEntry {
                    name: cap.to_string(),
                    value: None,
                });
            }
        }
        Self { entries }
    }

    /// Parse capabilities from v2 capability advertisement lines.
    ///
    /// Each line is a capability, optionally with `=value`.
    pub fn parse_v2(lines: &[Vec<u8>]) -> Self {
        let mut entries = Vec::new();
        for line in lines {
            let s = String::from_utf8_lossy(line);
            let s = s.trim_end_matches('\n');
            if let Some(eq_pos) = s.find('=') {
                entries.push(CapabilityEntry {
                    name: s[..eq_pos].to_string(),
                    value: Some(s[eq_pos + 1..].to_string()),
                });
            } else {
                entries.push(CapabilityEntry {
                    name: s.to_string(),
                    value: None,
                });
            }
        }
        Self { entries }
    }

    /// Check if a capability is advertised.
    pub fn has(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    /// Get the value of a capability (e.g., `symref=HEAD:refs/heads/main`).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }

    /// Get all values for a capability that may appear multiple times.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.name == name)
            .filter_map(|e| e.value.as_deref())
            .collect()
    }

    /// Get all capability entries.
    pub fn entries(&self) -> &[CapabilityEntry] {
        &self.entries
    }

}

impl std::fmt::Display for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for e in &self.entries {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            if let Some(ref v) = e.value {
                write!(f, "{}={}", e.name, v)?;
            } else {
                write!(f, "{}", e.name)?;
            }
        }
        Ok(())
    }
}

/// Select the best sideband mode from server capabilities.
pub fn select_sideband(caps: &Capabilities) -> SidebandMode {
    if caps.has("side-band-64k") {
        SidebandMode::Band64k
    } else if caps.has("side-band") {
        SidebandMode::Band
    } else {
        SidebandMode::None
    }
}

/// Sideband mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidebandMode {
    /// No sideband — raw pack data.
    None,
    /// side-band (1000 byte max per packet).
    Band,
    /// side-band-64k (65516 byte max per packet).
    Band64k,
}
