// A simulated machine for driving the provisioning pipeline without root,
// real block devices or systemd.

#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Result;
use async_trait::async_trait;
use cryptpilot_provision::{
    cmd::provision::ConfirmPrompt,
    config::{PathsConfig, ProvisionConfig},
    fs::host::{CommandOutput, ExternalCommand, Host},
    types::CallingUser,
};
use tempfile::TempDir;

pub const TEST_DEVICE: &str = "/dev/testloop0";
pub const OUTER_UUID: &str = "7d2f4b1e-3c9a-4e8f-b5d6-0a1c2e3f4a5b";
pub const INNER_UUID: &str = "c4a1e9f2-6b3d-4f7a-8e2c-9d0b1a2c3e4f";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub input: Option<Vec<u8>>,
}

impl RecordedCommand {
    /// The first argument that is not a global flag.
    pub fn action(&self) -> Option<&str> {
        self.args
            .iter()
            .map(String::as_str)
            .find(|arg| *arg != "--debug")
    }

    pub fn is(&self, program: &str, action: &str) -> bool {
        self.program == program && self.action() == Some(action)
    }
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub commands: Vec<RecordedCommand>,
    /// Paths that behave like block devices.
    pub devices: BTreeSet<PathBuf>,
    pub busy: BTreeSet<PathBuf>,
    /// Filesystem label to device, as `blkid -L` reports it.
    pub labels: BTreeMap<String, String>,
    pub uuids: BTreeMap<PathBuf, String>,
    /// Key material of every unlock slot, per LUKS device.
    pub key_slots: BTreeMap<PathBuf, Vec<Vec<u8>>>,
    /// Mapping name to outer device of every open container.
    pub active: BTreeMap<String, PathBuf>,
    pub mounts: BTreeMap<PathBuf, PathBuf>,
    pub enabled_units: Vec<String>,
    /// Program whose every invocation fails.
    pub failing_program: Option<String>,
    /// Program that installs a word list, and the file it writes.
    pub installer: Option<(String, PathBuf)>,
}

pub struct FakeHost {
    mapper_dir: PathBuf,
    pub state: Mutex<FakeState>,
}

fn output(code: i32, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> CommandOutput {
    CommandOutput {
        code,
        stdout: stdout.into(),
        stderr: stderr.into(),
    }
}

fn ok() -> CommandOutput {
    output(0, "", "")
}

/// Arguments that are neither flags nor the value of `--key-file`/`-L` style
/// options, in order.
fn positionals(args: &[String]) -> Vec<&str> {
    let mut result = vec![];
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        match arg.as_str() {
            "--key-file" | "--type" | "--header-backup-file" | "-L" | "-s" | "-o" => {
                skip_next = true
            }
            a if a.starts_with('-') => {}
            a => result.push(a),
        }
    }
    result
}

fn option_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == name)
        .and_then(|index| args.get(index + 1))
        .map(String::as_str)
}

pub fn sample_words(count: usize) -> String {
    (0..count)
        .map(|i| {
            let mut word = String::from("w");
            let mut n = i;
            for _ in 0..4 {
                word.push((b'a' + (n % 26) as u8) as char);
                n /= 26;
            }
            word
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl FakeHost {
    pub fn new(mapper_dir: impl Into<PathBuf>) -> Self {
        let mut state = FakeState::default();
        state.devices.insert(TEST_DEVICE.into());
        state.uuids.insert(TEST_DEVICE.into(), OUTER_UUID.into());
        Self {
            mapper_dir: mapper_dir.into(),
            state: Mutex::new(state),
        }
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn count(&self, program: &str, action: &str) -> usize {
        self.commands()
            .iter()
            .filter(|command| command.is(program, action))
            .count()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn cryptsetup(&self, state: &mut FakeState, command: &RecordedCommand) -> CommandOutput {
        let args = command
            .args
            .iter()
            .filter(|arg| *arg != "--debug")
            .cloned()
            .collect::<Vec<_>>();
        let Some(action) = args.first().map(String::as_str) else {
            return output(1, "", "no action given");
        };
        let operands = positionals(&args[1..]);
        let stdin_key = args
            .iter()
            .any(|arg| arg == "--key-file=-")
            .then(|| command.input.clone().unwrap_or_default());

        match (action, operands.as_slice()) {
            ("isLuks", [dev]) => match state.key_slots.contains_key(Path::new(dev)) {
                true => ok(),
                false => output(1, "", ""),
            },
            ("luksFormat", [dev]) => {
                let Some(key) = stdin_key.filter(|key| !key.is_empty()) else {
                    return output(1, "", "No passphrase given");
                };
                state.key_slots.insert(dev.into(), vec![key]);
                state.uuids.entry(dev.into()).or_insert(OUTER_UUID.into());
                ok()
            }
            ("luksHeaderBackup", [dev]) => {
                if !state.key_slots.contains_key(Path::new(dev)) {
                    return output(1, "", format!("Device {dev} is not a valid LUKS device."));
                }
                let Some(file) = option_value(&args, "--header-backup-file") else {
                    return output(1, "", "No backup file given");
                };
                match std::fs::write(file, b"LUKS\xba\xbe fake header") {
                    Ok(()) => ok(),
                    Err(e) => output(1, "", e.to_string()),
                }
            }
            ("status", [name]) => match state.active.contains_key(*name) {
                true => output(0, format!("/dev/mapper/{name} is active."), ""),
                false => output(4, format!("/dev/mapper/{name} is inactive."), ""),
            },
            ("open", [dev, name]) => {
                if state.active.contains_key(*name) {
                    return output(5, "", format!("Device {name} already exists."));
                }
                let key = match (stdin_key, option_value(&args, "--key-file")) {
                    (Some(key), _) => key,
                    (None, Some(keyfile)) => match std::fs::read(keyfile) {
                        Ok(key) => key,
                        Err(e) => return output(1, "", e.to_string()),
                    },
                    (None, None) => return output(1, "", "No key given"),
                };
                let slots = state.key_slots.get(Path::new(dev)).cloned().unwrap_or_default();
                if !slots.contains(&key) {
                    return output(2, "", "No key available with this passphrase.");
                }
                state.active.insert(name.to_string(), dev.into());
                ok()
            }
            ("luksAddKey", [dev, keyfile]) => {
                let Some(key) = stdin_key else {
                    return output(1, "", "No existing key given");
                };
                let new_key = match std::fs::read(keyfile) {
                    Ok(new_key) => new_key,
                    Err(e) => return output(1, "", e.to_string()),
                };
                let Some(slots) = state.key_slots.get_mut(Path::new(dev)) else {
                    return output(1, "", format!("Device {dev} is not a valid LUKS device."));
                };
                if !slots.contains(&key) {
                    return output(2, "", "No key available with this passphrase.");
                }
                slots.push(new_key);
                ok()
            }
            ("close", [name]) => match state.active.remove(*name) {
                Some(_) => ok(),
                None => output(4, "", format!("Device {name} is not active.")),
            },
            _ => output(1, "", format!("unsupported cryptsetup call: {args:?}")),
        }
    }

    fn blkid(&self, state: &mut FakeState, command: &RecordedCommand) -> CommandOutput {
        if let Some(label) = option_value(&command.args, "-L") {
            return match state.labels.get(label) {
                Some(device) => output(0, format!("{device}\n"), ""),
                None => output(2, "", ""),
            };
        }
        match positionals(&command.args).last() {
            Some(dev) => match state.uuids.get(Path::new(dev)) {
                Some(uuid) => output(0, format!("{uuid}\n"), ""),
                None => output(2, "", ""),
            },
            None => output(4, "", "usage"),
        }
    }

    fn mkfs(&self, state: &mut FakeState, command: &RecordedCommand) -> CommandOutput {
        let Some(dev) = positionals(&command.args).last().map(|dev| PathBuf::from(*dev)) else {
            return output(1, "", "no device given");
        };
        let mapped = state
            .active
            .keys()
            .any(|name| self.mapper_dir.join(name) == dev);
        if !mapped {
            return output(1, "", format!("{} does not exist", dev.display()));
        }
        if let Some(label) = option_value(&command.args, "-L") {
            state
                .labels
                .insert(label.to_owned(), dev.display().to_string());
        }
        state.uuids.insert(dev, INNER_UUID.into());
        ok()
    }
}

#[async_trait]
impl Host for FakeHost {
    async fn exec(&self, command: &ExternalCommand) -> Result<CommandOutput> {
        let recorded = RecordedCommand {
            program: command.program().to_owned(),
            args: command.args_lossy(),
            input: command.input().map(|input| input.as_bytes().to_vec()),
        };

        let mut state = self.state.lock().unwrap();
        state.commands.push(recorded.clone());

        if state.failing_program.as_deref() == Some(recorded.program.as_str()) {
            return Ok(output(1, "", "simulated failure"));
        }
        if let Some((installer, wordfile)) = state.installer.clone() {
            if installer == recorded.program {
                if let Some(parent) = wordfile.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&wordfile, sample_words(3000))?;
                return Ok(ok());
            }
        }

        let result = match recorded.program.as_str() {
            "cryptsetup" => self.cryptsetup(&mut state, &recorded),
            "blkid" => self.blkid(&mut state, &recorded),
            "mkfs.ext4" | "mkfs.xfs" => self.mkfs(&mut state, &recorded),
            "mount" => match positionals(&recorded.args).as_slice() {
                [dev, mount_point] if Path::new(mount_point).is_dir() => {
                    state.mounts.insert(mount_point.into(), dev.into());
                    ok()
                }
                _ => output(32, "", "mount: bad usage or missing mount point"),
            },
            "umount" => match positionals(&recorded.args).as_slice() {
                [mount_point] if state.mounts.remove(Path::new(mount_point)).is_some() => ok(),
                _ => output(32, "", "umount: not mounted"),
            },
            "systemctl" => match positionals(&recorded.args).as_slice() {
                ["daemon-reload"] => ok(),
                ["enable", unit] => {
                    state.enabled_units.push(unit.to_string());
                    ok()
                }
                _ => output(1, "", "unsupported systemctl call"),
            },
            program => output(127, "", format!("{program}: command not found")),
        };
        Ok(result)
    }

    fn canonicalize(&self, path: &Path) -> std::io::Result<PathBuf> {
        if self.state.lock().unwrap().devices.contains(path) {
            return Ok(path.to_owned());
        }
        std::fs::canonicalize(path)
    }

    fn is_block_device(&self, path: &Path) -> bool {
        self.state.lock().unwrap().devices.contains(path)
    }

    fn is_device_busy(&self, path: &Path) -> Result<bool> {
        Ok(self.state.lock().unwrap().busy.contains(path))
    }
}

/// Answers every question with the same text and remembers the questions.
pub struct ScriptedPrompt {
    answer: String,
    pub asked: Mutex<Vec<String>>,
}

impl ScriptedPrompt {
    pub fn new(answer: &str) -> Self {
        Self {
            answer: answer.to_owned(),
            asked: Mutex::new(vec![]),
        }
    }

    pub fn times_asked(&self) -> usize {
        self.asked.lock().unwrap().len()
    }
}

impl ConfirmPrompt for ScriptedPrompt {
    fn ask(&self, prompt: &str) -> Result<String> {
        self.asked.lock().unwrap().push(prompt.to_owned());
        Ok(self.answer.clone())
    }
}

/// A machine rooted in a temporary directory: every path the pipeline writes
/// to lives below `root`.
pub struct TestEnv {
    pub root: TempDir,
    pub config: ProvisionConfig,
    pub user: CallingUser,
    pub host: FakeHost,
}

pub const FSTAB_BASE: &str = "UUID=1111-2222  /  ext4  defaults  0  1\n";

impl TestEnv {
    pub fn new() -> Result<Self> {
        let root = tempfile::tempdir()?;
        let at = |relative: &str| root.path().join(relative);

        let paths = PathsConfig {
            fstab: at("etc/fstab"),
            mapper_dir: at("dev/mapper"),
            mount_root: at("mnt"),
            key_dir: at("etc/luks-keys"),
            script_dir: at("etc/luks-scripts"),
            unit_dir: at("etc/systemd/system"),
            protected_paths: vec![],
        };
        std::fs::create_dir_all(at("etc"))?;
        std::fs::write(&paths.fstab, FSTAB_BASE)?;

        let wordfile = at("usr/share/dict/words");
        std::fs::create_dir_all(at("usr/share/dict"))?;
        std::fs::write(&wordfile, sample_words(3000))?;

        let home = at("home/operator");
        std::fs::create_dir_all(&home)?;

        let mut config = ProvisionConfig::default();
        config.paths = paths;
        config.passphrase.wordfiles = vec![wordfile];

        let user = CallingUser {
            name: "operator".into(),
            uid: nix::unistd::geteuid().as_raw(),
            gid: nix::unistd::getegid().as_raw(),
            home,
        };

        let host = FakeHost::new(config.paths.mapper_dir.clone());

        Ok(Self {
            root,
            config,
            user,
            host,
        })
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.path().join(relative)
    }
}
