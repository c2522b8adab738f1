//! Edits applied to the wine prefix during provisioning: registry hives and
//! the `dosdevices` drive links.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::installer::InstallError;
use crate::config::DriveMapping;
use crate::logging::current_ms;

/// Services switched to manual start in every mode and disabled when only
/// essential services should run.
const OPTIONAL_SERVICES: [&str; 12] = [
    "BITS",
    "Eventlog",
    "HTTP",
    "LanmanServer",
    "NDIS",
    "PlugPlay",
    "RpcSs",
    "scardsvr",
    "Schedule",
    "Spooler",
    "StiSvc",
    "TermService",
];

const SERVICE_DEMAND_START: u32 = 3;
const SERVICE_DISABLED: u32 = 4;

/// DirectShow audio renderer instance that native dsound expects to find.
const WAVE_RENDERER_KEYS: [&str; 2] = [
    "Software\\Classes\\CLSID\\{083863F1-70DE-11D0-BD40-00A0C911CE86}\\Instance\\{E30629D1-27E5-11CE-875D-00608CB78066}",
    "Software\\Classes\\Wow6432Node\\CLSID\\{083863F1-70DE-11D0-BD40-00A0C911CE86}\\Instance\\{E30629D1-27E5-11CE-875D-00608CB78066}",
];
const WAVE_RENDERER_CLSID: &str = "{E30629D1-27E5-11CE-875D-00608CB78066}";
const WAVE_RENDERER_FILTER_DATA: &str = "02000000000080000100000000000000307069330200000000000000010000000000000000000000307479330000000038000000480000006175647300001000800000aa00389b710100000000001000800000aa00389b71";

pub trait PrefixEditor: Send + Sync {
    /// `alsa` or `pulse`.
    fn set_audio_driver(&self, driver: &str) -> Result<(), InstallError>;
    /// Theme string `LIGHT|DARK,IMAGE|COLOR,#rrggbb`.
    fn apply_desktop_theme(&self, theme: &str) -> Result<(), InstallError>;
    fn set_essential_services_only(&self, essential_only: bool) -> Result<(), InstallError>;
    /// Point the DLL overrides for `files` at native or builtin copies.
    fn override_dlls(&self, files: &[String], native: bool) -> Result<(), InstallError>;
    /// System registry entries a windows component needs when switched
    /// between native and builtin. Components without entries are a no-op.
    fn set_win_component_registry_keys(&self, component: &str, native: bool) -> Result<(), InstallError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegValue {
    Str(String),
    Dword(u32),
    Hex(Vec<u8>),
}

impl RegValue {
    /// Binary value from a string of hex digit pairs. Stray characters are
    /// skipped.
    pub fn hex(digits: &str) -> Self {
        let nibbles: Vec<u8> = digits
            .chars()
            .filter_map(|c| c.to_digit(16))
            .map(|d| d as u8)
            .collect();
        RegValue::Hex(nibbles.chunks_exact(2).map(|pair| pair[0] << 4 | pair[1]).collect())
    }

    fn encode(&self) -> String {
        match self {
            RegValue::Str(value) => format!("\"{}\"", escape(value)),
            RegValue::Dword(value) => format!("dword:{value:08x}"),
            RegValue::Hex(bytes) => {
                let body: Vec<String> = bytes.iter().map(|b| format!("{b:02x}")).collect();
                format!("hex:{}", body.join(","))
            }
        }
    }
}

fn escape(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Line-oriented editor for a wine `.reg` hive file.
#[derive(Debug, Clone)]
pub struct RegistryFile {
    path: PathBuf,
    lines: Vec<String>,
}

impl RegistryFile {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, InstallError> {
        let path = path.into();
        let lines = match fs::read_to_string(&path) {
            Ok(raw) => raw.lines().map(str::to_string).collect(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                vec!["WINE REGISTRY Version 2".to_string(), String::new()]
            }
            Err(source) => return Err(InstallError::Prefix { path, source }),
        };
        Ok(Self { path, lines })
    }

    fn header(key: &str) -> String {
        format!("[{}]", escape(key))
    }

    /// Line range of the section body for `key`, header excluded.
    fn section(&self, key: &str) -> Option<(usize, usize)> {
        let header = Self::header(key);
        let start = self.lines.iter().position(|line| {
            line.strip_prefix(&header)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with(' '))
        })?;
        let end = self.lines[start + 1..]
            .iter()
            .position(|line| line.starts_with('['))
            .map(|offset| start + 1 + offset)
            .unwrap_or(self.lines.len());
        Some((start + 1, end))
    }

    fn value_line(&self, key: &str, name: &str) -> Option<usize> {
        let (start, end) = self.section(key)?;
        let prefix = format!("\"{}\"=", escape(name));
        (start..end).find(|idx| self.lines[*idx].starts_with(&prefix))
    }

    pub fn get(&self, key: &str, name: &str) -> Option<&str> {
        let idx = self.value_line(key, name)?;
        self.lines[idx].split_once('=').map(|(_, value)| value)
    }

    pub fn set(&mut self, key: &str, name: &str, value: RegValue) {
        let line = format!("\"{}\"={}", escape(name), value.encode());
        if let Some(idx) = self.value_line(key, name) {
            self.lines[idx] = line;
            return;
        }
        match self.section(key) {
            Some((start, end)) => {
                let mut insert_at = end;
                while insert_at > start && self.lines[insert_at - 1].trim().is_empty() {
                    insert_at -= 1;
                }
                self.lines.insert(insert_at, line);
            }
            None => {
                if self.lines.last().is_some_and(|last| !last.is_empty()) {
                    self.lines.push(String::new());
                }
                let stamp = current_ms() / 1000;
                self.lines.push(format!("{} {stamp}", Self::header(key)));
                self.lines.push(line);
                self.lines.push(String::new());
            }
        }
    }

    pub fn remove(&mut self, key: &str, name: &str) {
        if let Some(idx) = self.value_line(key, name) {
            self.lines.remove(idx);
        }
    }

    /// Drop the whole section for `key`.
    pub fn remove_key(&mut self, key: &str) {
        if let Some((start, end)) = self.section(key) {
            self.lines.drain(start - 1..end);
        }
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.section(key).is_some()
    }

    pub fn save(&self) -> Result<(), InstallError> {
        let mut contents = self.lines.join("\n");
        contents.push('\n');
        let result = self
            .path
            .parent()
            .map(fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|_| fs::write(&self.path, contents));
        result.map_err(|source| InstallError::Prefix {
            path: self.path.clone(),
            source,
        })
    }
}

/// [`PrefixEditor`] writing `user.reg` and `system.reg` under the prefix.
#[derive(Debug, Clone)]
pub struct WineRegistry {
    prefix_dir: PathBuf,
}

impl WineRegistry {
    pub fn new(prefix_dir: impl Into<PathBuf>) -> Self {
        Self {
            prefix_dir: prefix_dir.into(),
        }
    }

    pub fn user_reg(&self) -> PathBuf {
        self.prefix_dir.join("user.reg")
    }

    pub fn system_reg(&self) -> PathBuf {
        self.prefix_dir.join("system.reg")
    }

    fn edit(&self, path: &Path, apply: impl FnOnce(&mut RegistryFile)) -> Result<(), InstallError> {
        let mut file = RegistryFile::open(path)?;
        apply(&mut file);
        file.save()
    }
}

fn rgb_triplet(hex: &str) -> Option<String> {
    let hex = hex.trim().trim_start_matches('#');
    if hex.len() != 6 {
        return None;
    }
    let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).ok();
    Some(format!("{} {} {}", channel(0..2)?, channel(2..4)?, channel(4..6)?))
}

impl PrefixEditor for WineRegistry {
    fn set_audio_driver(&self, driver: &str) -> Result<(), InstallError> {
        self.edit(&self.user_reg(), |reg| {
            reg.set("Software\\Wine\\Drivers", "Audio", RegValue::Str(driver.to_string()));
        })
    }

    fn apply_desktop_theme(&self, theme: &str) -> Result<(), InstallError> {
        let mut parts = theme.split(',');
        let dark = parts.next().is_some_and(|mode| mode.eq_ignore_ascii_case("DARK"));
        let _background_kind = parts.next();
        let background = parts.next().and_then(rgb_triplet);
        let (window, text) = if dark {
            ("30 30 30", "255 255 255")
        } else {
            ("255 255 255", "0 0 0")
        };
        self.edit(&self.user_reg(), |reg| {
            let colors = "Control Panel\\Colors";
            reg.set(colors, "Window", RegValue::Str(window.to_string()));
            reg.set(colors, "WindowText", RegValue::Str(text.to_string()));
            if let Some(background) = background {
                reg.set(colors, "Background", RegValue::Str(background));
            }
        })
    }

    fn set_essential_services_only(&self, essential_only: bool) -> Result<(), InstallError> {
        let start = if essential_only {
            SERVICE_DISABLED
        } else {
            SERVICE_DEMAND_START
        };
        self.edit(&self.system_reg(), |reg| {
            for service in OPTIONAL_SERVICES {
                let key = format!("System\\CurrentControlSet\\Services\\{service}");
                reg.set(&key, "Start", RegValue::Dword(start));
            }
        })
    }

    fn override_dlls(&self, files: &[String], native: bool) -> Result<(), InstallError> {
        self.edit(&self.user_reg(), |reg| {
            for file in files {
                let name = file.strip_suffix(".dll").unwrap_or(file);
                if native {
                    reg.set(
                        "Software\\Wine\\DllOverrides",
                        name,
                        RegValue::Str("native,builtin".to_string()),
                    );
                } else {
                    reg.remove("Software\\Wine\\DllOverrides", name);
                }
            }
        })
    }

    fn set_win_component_registry_keys(&self, component: &str, native: bool) -> Result<(), InstallError> {
        if component != "directsound" {
            return Ok(());
        }
        self.edit(&self.system_reg(), |reg| {
            for key in WAVE_RENDERER_KEYS {
                if native {
                    reg.set(key, "CLSID", RegValue::Str(WAVE_RENDERER_CLSID.to_string()));
                    reg.set(key, "FilterData", RegValue::hex(WAVE_RENDERER_FILTER_DATA));
                    reg.set(key, "FriendlyName", RegValue::Str("Wave Audio Renderer".to_string()));
                } else {
                    reg.remove_key(key);
                }
            }
        })
    }
}

fn prefix_err(path: &Path) -> impl FnOnce(io::Error) -> InstallError {
    let path = path.to_path_buf();
    move |source| InstallError::Prefix { path, source }
}

/// `d:`-style entry name for a drive letter, or `None` when the letter is
/// not a single ASCII letter.
fn drive_name(letter: &str) -> Option<String> {
    let mut chars = letter.trim().trim_end_matches(':').chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => Some(format!("{}:", c.to_ascii_lowercase())),
        _ => None,
    }
}

/// Point `<prefix>/dosdevices/<letter>:` at each mapped host path. `c:` always
/// links to `../drive_c` and `z:` to the image root; stale letter links are
/// removed. Returns whether any link changed.
pub fn sync_drive_links(prefix_dir: &Path, root: &Path, drives: &[DriveMapping]) -> Result<bool, InstallError> {
    let dir = prefix_dir.join("dosdevices");
    fs::create_dir_all(&dir).map_err(prefix_err(&dir))?;

    let mut wanted = BTreeMap::new();
    for drive in drives {
        if drive.path.trim().is_empty() {
            continue;
        }
        if let Some(name) = drive_name(&drive.letter) {
            wanted.insert(name, PathBuf::from(drive.path.trim()));
        }
    }
    wanted.insert("c:".to_string(), PathBuf::from("../drive_c"));
    wanted.insert("z:".to_string(), root.to_path_buf());

    let mut changed = false;
    for entry in fs::read_dir(&dir).map_err(prefix_err(&dir))? {
        let entry = entry.map_err(prefix_err(&dir))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if drive_name(name.trim_end_matches(':')).as_deref() != Some(name.as_str())
            || wanted.contains_key(&name)
        {
            continue;
        }
        let path = entry.path();
        if entry.file_type().map_err(prefix_err(&path))?.is_symlink() {
            fs::remove_file(&path).map_err(prefix_err(&path))?;
            changed = true;
        }
    }

    for (name, target) in &wanted {
        let link = dir.join(name);
        match fs::read_link(&link) {
            Ok(current) if current == *target => continue,
            Ok(_) => fs::remove_file(&link).map_err(prefix_err(&link))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(InstallError::Prefix { path: link, source }),
        }
        std::os::unix::fs::symlink(target, &link).map_err(prefix_err(&link))?;
        changed = true;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_creates_then_updates_value() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WineRegistry::new(dir.path());
        registry.set_audio_driver("alsa").unwrap();
        registry.set_audio_driver("pulse").unwrap();

        let contents = fs::read_to_string(registry.user_reg()).unwrap();
        assert!(contents.starts_with("WINE REGISTRY Version 2"));
        assert!(contents.contains("[Software\\\\Wine\\\\Drivers] "));
        assert_eq!(contents.matches("\"Audio\"=").count(), 1);
        let reg = RegistryFile::open(registry.user_reg()).unwrap();
        assert_eq!(reg.get("Software\\Wine\\Drivers", "Audio"), Some("\"pulse\""));
    }

    #[test]
    fn values_insert_into_existing_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user.reg");
        fs::write(
            &path,
            "WINE REGISTRY Version 2\n\n[Software\\\\Wine\\\\DllOverrides] 1700000000\n\"d3d9\"=\"native,builtin\"\n\n[Software\\\\Wine\\\\Drivers] 1700000000\n\"Audio\"=\"alsa\"\n",
        )
        .unwrap();
        let registry = WineRegistry::new(dir.path());
        registry
            .override_dlls(&["dsound.dll".to_string(), "d3d9.dll".to_string()], false)
            .unwrap();
        registry.override_dlls(&["dsound.dll".to_string()], true).unwrap();

        let reg = RegistryFile::open(&path).unwrap();
        assert_eq!(reg.get("Software\\Wine\\DllOverrides", "d3d9"), None);
        assert_eq!(
            reg.get("Software\\Wine\\DllOverrides", "dsound"),
            Some("\"native,builtin\"")
        );
        assert_eq!(reg.get("Software\\Wine\\Drivers", "Audio"), Some("\"alsa\""));
    }

    #[test]
    fn directsound_renderer_keys_follow_native_switch() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WineRegistry::new(dir.path());
        registry.set_win_component_registry_keys("directsound", true).unwrap();
        registry.set_win_component_registry_keys("direct3d", true).unwrap();

        let system = RegistryFile::open(registry.system_reg()).unwrap();
        for key in WAVE_RENDERER_KEYS {
            assert_eq!(system.get(key, "FriendlyName"), Some("\"Wave Audio Renderer\""));
            assert!(system.get(key, "FilterData").unwrap().starts_with("hex:02,00,00,00,"));
        }

        registry.set_win_component_registry_keys("directsound", false).unwrap();
        let system = RegistryFile::open(registry.system_reg()).unwrap();
        assert!(WAVE_RENDERER_KEYS.iter().all(|key| !system.has_key(key)));
        assert!(!fs::read_to_string(registry.system_reg()).unwrap().contains("Wave Audio"));
    }

    #[test]
    fn hex_values_encode_as_byte_lists() {
        assert_eq!(RegValue::hex("0a0B ff").encode(), "hex:0a,0b,ff");
    }

    #[test]
    fn drive_links_track_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join(".wine");
        let root = dir.path().join("imagefs");
        let drives = vec![
            DriveMapping {
                letter: "D".into(),
                path: "/storage/Download".into(),
            },
            DriveMapping {
                letter: "bad".into(),
                path: "/storage/ignored".into(),
            },
        ];

        assert!(sync_drive_links(&prefix, &root, &drives).unwrap());
        let links = prefix.join("dosdevices");
        assert_eq!(fs::read_link(links.join("c:")).unwrap(), PathBuf::from("../drive_c"));
        assert_eq!(fs::read_link(links.join("z:")).unwrap(), root);
        assert_eq!(fs::read_link(links.join("d:")).unwrap(), PathBuf::from("/storage/Download"));
        assert!(!sync_drive_links(&prefix, &root, &drives).unwrap());

        let moved = vec![DriveMapping {
            letter: "E".into(),
            path: "/storage/Games".into(),
        }];
        assert!(sync_drive_links(&prefix, &root, &moved).unwrap());
        assert!(fs::symlink_metadata(links.join("d:")).is_err());
        assert_eq!(fs::read_link(links.join("e:")).unwrap(), PathBuf::from("/storage/Games"));
    }

    #[test]
    fn services_and_theme() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WineRegistry::new(dir.path());
        registry.set_essential_services_only(true).unwrap();
        registry.apply_desktop_theme("DARK,COLOR,#0277bd").unwrap();

        let system = RegistryFile::open(registry.system_reg()).unwrap();
        assert_eq!(
            system.get("System\\CurrentControlSet\\Services\\Spooler", "Start"),
            Some("dword:00000004")
        );
        let user = RegistryFile::open(registry.user_reg()).unwrap();
        assert_eq!(user.get("Control Panel\\Colors", "Background"), Some("\"2 119 189\""));
        assert_eq!(user.get("Control Panel\\Colors", "Window"), Some("\"30 30 30\""));
    }
}
