//! Per-vendor CLI behaviour.
//!
//! A [`VendorProfile`] carries everything the session layer needs to drive
//! one family of devices: the prompt pattern, the pager banner, the commands
//! that disable paging on login, how to elevate privileges, and which output
//! markers mean the device rejected a command.
//!
//! Prompt patterns are multiline and anchored to the end of the buffer with
//! `\z`, so a prompt-looking line in the middle of output never matches.
//!
//! # Prompt Examples
//!
//! ```text
//! router>                 cisco_ios user exec
//! router#                 cisco_ios privileged exec
//! <HUAWEI>                huawei user view
//! [~HUAWEI]               huawei system view
//! admin@mx960>            juniper operational mode
//! ->                      alcatel_aos
//! A:admin@sr1#            alcatel_sros (Nokia)
//! admin@PA-220>           paloalto_panos
//! FGT60E #                fortinet
//! ```

use std::time::Duration;

use regex::bytes::Regex;

/// Privilege elevation, e.g. Cisco `enable`.
#[derive(Debug, Clone)]
pub struct Elevation {
    pub command: String,
    /// Prompt asking for the elevation secret.
    pub password_prompt: Regex,
    /// Prompt shown once elevated.
    pub elevated_prompt: Regex,
}

/// CLI behaviour for one device family.
#[derive(Debug, Clone)]
pub struct VendorProfile {
    /// Profile name, e.g. `cisco_ios`.
    pub name: String,

    /// Display name used in transcripts.
    pub vendor: String,

    /// Any prompt the device may show.
    pub prompt: Regex,

    /// Pager banner shown when output exceeds one screen.
    pub pager: Option<Regex>,

    /// Commands run right after login, typically to disable paging.
    pub on_open_commands: Vec<String>,

    /// How to reach privileged mode when a secret is configured.
    pub elevation: Option<Elevation>,

    /// Output substrings that mean the command was rejected.
    pub failed_when_contains: Vec<String>,

    /// Connect timeout overriding the run-wide default.
    pub connect_timeout: Option<Duration>,
}

const GENERIC_PROMPT: &str = r"(?m)^[^\n]{0,80}[>#$%\]]\s*\z";
const CISCO_PROMPT: &str = r"(?m)^[\w.\-@/:()]{1,63}[>#]\s*\z";
const VRP_PROMPT: &str = r"(?m)^(?:<[\w.\-@/:\s]{1,63}>|\[[~*]?[\w.\-@/:\s]{1,63}\])\s*\z";
const JUNOS_PROMPT: &str = r"(?m)^(?:\{\w+(?::(?:\w+)?\d)?\}(?:\[edit[^\]]*\])?\n)?[\w\-@()/:.]{1,63}[>#%]\s?\z";
const AOS_PROMPT: &str = r"(?m)^[\w.\-@/:()]{0,63}\s?->\s*\z";
const SROS_PROMPT: &str = r"(?m)^\*?[ABCD]:[\w.\-@/:()>]{1,63}[#$]\s*\z";
const PANOS_PROMPT: &str = r"(?m)^[\w.\-@()/:]{1,63}(?:\(active\)|\(passive\))?[>#]\s*\z";
const FORTIOS_PROMPT: &str = r"(?m)^[\w.\-@()/: ]{1,63}\s?[#$]\s*\z";

const MORE_PAGER: &str = r"(?i)[ \t]*(?:-{2,}\s*\(?more[^\n]*?-{2,}|<-{2,}\s*more\s*-{2,}>|press any key to continue[^\n]*)\s*\z";

const CISCO_FAILURES: &[&str] = &[
    "% Invalid input",
    "% Incomplete command",
    "% Ambiguous command",
    "% Unknown command",
    "% Invalid command",
];

impl VendorProfile {
    /// Create a profile with a generic prompt and no vendor quirks.
    pub fn new(name: impl Into<String>, vendor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vendor: vendor.into(),
            prompt: compile(GENERIC_PROMPT),
            pager: Some(compile(MORE_PAGER)),
            on_open_commands: Vec::new(),
            elevation: None,
            failed_when_contains: Vec::new(),
            connect_timeout: None,
        }
    }

    /// Pick the profile for a device-type tag. Unknown tags fall back to a
    /// generic profile named after the tag.
    pub fn for_device_type(device_type: &str) -> Self {
        let tag = device_type.trim().to_lowercase();
        let tag = tag.strip_suffix("_telnet").unwrap_or(&tag).to_string();
        let vendor = vendor_name(&tag);

        if tag.starts_with("cisco") || tag.starts_with("ruijie") || tag.starts_with("arista") {
            cisco_like(&tag, vendor)
        } else if tag.starts_with("huawei") {
            Self::new(tag, vendor)
                .with_prompt(VRP_PROMPT)
                .with_on_open_command("screen-length 0 temporary")
                .with_failure_pattern("Error: Unrecognized command")
                .with_failure_pattern("Error: Wrong parameter")
                .with_failure_pattern("Error: Incomplete command")
                .with_failure_pattern("Error:Too many parameters")
                .with_connect_timeout(Duration::from_secs(15))
        } else if tag.starts_with("hp_comware") || tag.starts_with("h3c") {
            Self::new(tag, vendor)
                .with_prompt(VRP_PROMPT)
                .with_on_open_command("screen-length disable")
                .with_failure_pattern("% Unrecognized command")
                .with_failure_pattern("% Wrong parameter")
                .with_failure_pattern("% Incomplete command")
        } else if tag.starts_with("juniper") {
            Self::new(tag, vendor)
                .with_prompt(JUNOS_PROMPT)
                .with_on_open_command("set cli screen-length 0")
                .with_on_open_command("set cli screen-width 511")
                .with_failure_pattern("unknown command")
                .with_failure_pattern("syntax error")
                .with_failure_pattern("is ambiguous")
                .with_failure_pattern("missing argument")
        } else if tag.starts_with("alcatel_sros") || tag.starts_with("nokia") {
            Self::new(tag, vendor)
                .with_prompt(SROS_PROMPT)
                .with_on_open_command("environment no more")
                .with_failure_pattern("Error:")
                .with_failure_pattern("MINOR:")
                .with_failure_pattern("MAJOR:")
        } else if tag.starts_with("alcatel") || tag.starts_with("ale") {
            Self::new(tag, vendor)
                .with_prompt(AOS_PROMPT)
                .with_failure_pattern("ERROR:")
                .with_failure_pattern("Invalid entry")
        } else if tag.starts_with("paloalto") {
            Self::new(tag, vendor)
                .with_prompt(PANOS_PROMPT)
                .with_on_open_command("set cli pager off")
                .with_failure_pattern("Unknown command")
                .with_failure_pattern("Invalid syntax")
        } else if tag.starts_with("fortinet") {
            Self::new(tag, vendor)
                .with_prompt(FORTIOS_PROMPT)
                .with_failure_pattern("Unknown action")
                .with_failure_pattern("Command fail")
        } else if tag.starts_with("dell") || tag.starts_with("extreme") {
            cisco_like(&tag, vendor)
        } else {
            Self::new(tag, vendor)
        }
    }

    /// Replace the prompt pattern.
    pub fn with_prompt(mut self, pattern: &str) -> Self {
        self.prompt = compile(pattern);
        self
    }

    pub fn with_on_open_command(mut self, command: impl Into<String>) -> Self {
        self.on_open_commands.push(command.into());
        self
    }

    pub fn with_failure_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.failed_when_contains.push(pattern.into());
        self
    }

    pub fn with_elevation(mut self, elevation: Elevation) -> Self {
        self.elevation = Some(elevation);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// First failure marker contained in `output`, if any.
    pub fn detect_failure(&self, output: &str) -> Option<&str> {
        self.failed_when_contains
            .iter()
            .find(|pattern| output.contains(pattern.as_str()))
            .map(String::as_str)
    }
}

fn cisco_like(tag: &str, vendor: String) -> VendorProfile {
    let profile = VendorProfile::new(tag, vendor)
        .with_prompt(CISCO_PROMPT)
        .with_on_open_command("terminal length 0")
        .with_elevation(Elevation {
            command: "enable".to_string(),
            password_prompt: compile(r"(?mi)^\s*password:\s*\z"),
            elevated_prompt: compile(r"#\s*\z"),
        });
    CISCO_FAILURES
        .iter()
        .fold(profile, |profile, pattern| profile.with_failure_pattern(*pattern))
}

// Every pattern in this module is a literal checked by the tests below.
fn compile(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(e) => panic!("invalid built-in pattern {pattern:?}: {e}"),
    }
}

/// Display name of the vendor behind a device-type tag.
pub fn vendor_name(device_type: &str) -> String {
    let tag = device_type.trim().to_lowercase();
    let name = match tag.as_str() {
        t if t.starts_with("cisco") => "Cisco",
        t if t.starts_with("huawei") => "华为",
        t if t.starts_with("hp_comware") || t.starts_with("h3c") => "H3C",
        t if t.starts_with("ruijie") => "锐捷",
        t if t.starts_with("juniper") => "Juniper",
        t if t.starts_with("arista") => "Arista",
        t if t.starts_with("fortinet") => "Fortinet",
        t if t.starts_with("paloalto") => "Palo Alto",
        t if t.starts_with("dell") => "Dell",
        t if t.starts_with("extreme") => "Extreme",
        t if t.starts_with("alcatel_sros") || t.starts_with("nokia") => "Nokia",
        t if t.starts_with("alcatel") || t.starts_with("ale") => "ALE",
        _ => return tag.to_uppercase(),
    };
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cisco_prompt_match() {
        let profile = VendorProfile::for_device_type("cisco_ios");
        assert!(profile.prompt.is_match(b"router>"));
        assert!(profile.prompt.is_match(b"router#"));
        assert!(profile.prompt.is_match(b"show version\nVersion 15.2\nrouter# "));
        assert!(profile.prompt.is_match(b"sw-core-01(config)#"));

        // Prompt-looking text mid-output must not match
        assert!(!profile.prompt.is_match(b"router#\nmore output"));
    }

    #[test]
    fn test_cisco_elevation_and_paging() {
        let profile = VendorProfile::for_device_type("cisco_ios");
        assert_eq!(profile.on_open_commands, vec!["terminal length 0"]);

        let elevation = profile.elevation.as_ref().unwrap();
        assert_eq!(elevation.command, "enable");
        assert!(elevation.password_prompt.is_match(b"enable\nPassword: "));
        assert!(elevation.elevated_prompt.is_match(b"router#"));
        assert!(!elevation.elevated_prompt.is_match(b"router>"));
    }

    #[test]
    fn test_huawei_prompt_match() {
        let profile = VendorProfile::for_device_type("huawei");
        assert!(profile.prompt.is_match(b"<HUAWEI>"));
        assert!(profile.prompt.is_match(b"<AR1220-Core>"));
        assert!(profile.prompt.is_match(b"[~HUAWEI]"));
        assert!(profile.prompt.is_match(b"[HUAWEI-GigabitEthernet0/0/1]"));
        assert!(!profile.prompt.is_match(b"router#"));
        assert_eq!(profile.connect_timeout, Some(Duration::from_secs(15)));
        assert_eq!(profile.on_open_commands, vec!["screen-length 0 temporary"]);
    }

    #[test]
    fn test_juniper_prompt_match() {
        let profile = VendorProfile::for_device_type("juniper_junos");
        assert!(profile.prompt.is_match(b"user@router>"));
        assert!(profile.prompt.is_match(b"{master:0}\nuser@router> "));
        assert!(profile.prompt.is_match(b"admin@mx960#"));
        assert!(profile.on_open_commands.contains(&"set cli screen-length 0".to_string()));
    }

    #[test]
    fn test_alcatel_prompt_match() {
        let profile = VendorProfile::for_device_type("alcatel_aos");
        assert!(profile.prompt.is_match(b"->"));
        assert!(profile.prompt.is_match(b"OS6860 -> "));
        assert!(!profile.prompt.is_match(b"router#"));

        let sros = VendorProfile::for_device_type("alcatel_sros");
        assert!(sros.prompt.is_match(b"A:admin@sr1#"));
        assert!(sros.prompt.is_match(b"*A:sr1>config>router# "));
        assert_eq!(sros.vendor, "Nokia");
    }

    #[test]
    fn test_other_vendor_prompts() {
        let panos = VendorProfile::for_device_type("paloalto_panos");
        assert!(panos.prompt.is_match(b"admin@PA-220>"));
        assert!(panos.prompt.is_match(b"admin@PA-220(active)>"));

        let fortinet = VendorProfile::for_device_type("fortinet");
        assert!(fortinet.prompt.is_match(b"FGT60E #"));
        assert!(fortinet.prompt.is_match(b"FGT60E $ "));
    }

    #[test]
    fn test_telnet_suffix_ignored() {
        let profile = VendorProfile::for_device_type("cisco_ios_telnet");
        assert_eq!(profile.name, "cisco_ios");
        assert_eq!(profile.vendor, "Cisco");
    }

    #[test]
    fn test_generic_fallback() {
        let profile = VendorProfile::for_device_type("mikrotik_routeros");
        assert_eq!(profile.name, "mikrotik_routeros");
        assert_eq!(profile.vendor, "MIKROTIK_ROUTEROS");
        assert!(profile.prompt.is_match(b"[admin@MikroTik] >"));
        assert!(profile.prompt.is_match(b"user@host:~$ "));
        assert!(profile.failed_when_contains.is_empty());
    }

    #[test]
    fn test_pager_match() {
        let profile = VendorProfile::for_device_type("cisco_ios");
        let pager = profile.pager.as_ref().unwrap();
        assert!(pager.is_match(b"line\n --More-- "));
        assert!(pager.is_match(b"line\n  ---- More ----"));
        assert!(pager.is_match(b"line\nPress any key to continue (Q to quit)"));
        assert!(!pager.is_match(b" --More-- \nline"));
    }

    #[test]
    fn test_detect_failure() {
        let profile = VendorProfile::for_device_type("cisco_ios");
        assert_eq!(
            profile.detect_failure("        ^\n% Invalid input detected at '^' marker."),
            Some("% Invalid input")
        );
        assert_eq!(profile.detect_failure("Cisco IOS Software, Version 15.2"), None);
    }

    #[test]
    fn test_vendor_names() {
        assert_eq!(vendor_name("cisco_nxos"), "Cisco");
        assert_eq!(vendor_name("huawei"), "华为");
        assert_eq!(vendor_name("hp_comware"), "H3C");
        assert_eq!(vendor_name("ruijie_os"), "锐捷");
        assert_eq!(vendor_name("alcatel_aos"), "ALE");
        assert_eq!(vendor_name("alcatel_sros"), "Nokia");
        assert_eq!(vendor_name("zte_zxros"), "ZTE_ZXROS");
    }
}
