//! Fakes for unit tests.

use crate::command::{CommandResult, CommandRunner, Invocation};
use crate::device::{UsbIdentity, UsbSource};
use crate::error::{Error, Result};
use crate::poll::Clock;
use crate::serial::{Port, PortOpener, SerialConfig};
use crate::storage::{BlockDevice, StorageSource};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Clock that only moves when slept on.
pub struct ManualClock {
    start: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Total time slept so far.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        *self.offset.lock().unwrap() += duration;
    }
}

type Rule = (String, Result<CommandResult>);

#[derive(Default)]
struct RunnerState {
    invocations: Vec<Invocation>,
    files: Vec<Option<Vec<u8>>>,
    rules: Vec<Rule>,
    queue: VecDeque<Result<CommandResult>>,
}

/// Runner returning scripted results and recording every invocation.
///
/// Resolution order: the first rule whose pattern occurs in the rendered
/// argv, then the queue, then plain success.
#[derive(Default)]
pub struct ScriptedRunner {
    state: Mutex<RunnerState>,
}

fn clone_result(result: &Result<CommandResult>) -> Result<CommandResult> {
    match result {
        Ok(r) => Ok(r.clone()),
        Err(Error::Timeout(msg)) => Err(Error::Timeout(msg.clone())),
        Err(e) => Err(Error::Io(io::Error::other(e.to_string()))),
    }
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next unmatched result.
    pub fn push(&self, result: Result<CommandResult>) {
        self.state.lock().unwrap().queue.push_back(result);
    }

    /// Answer every invocation containing `pattern` with `result`.
    pub fn on(&self, pattern: &str, result: Result<CommandResult>) {
        self.state
            .lock()
            .unwrap()
            .rules
            .push((pattern.to_string(), result));
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().unwrap().invocations.clone()
    }

    /// Rendered command lines, in order.
    pub fn commands(&self) -> Vec<String> {
        self.invocations().iter().map(ToString::to_string).collect()
    }

    /// Program followed by arguments of invocation `index`.
    pub fn argv(&self, index: usize) -> Vec<String> {
        let inv = &self.invocations()[index];
        std::iter::once(inv.program.clone())
            .chain(inv.args.iter().cloned())
            .collect()
    }

    /// Contents of the file named by the last argument of invocation
    /// `index`, captured while the command ran.
    pub fn captured_file(&self, index: usize) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files[index].clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandResult> {
        let mut state = self.state.lock().unwrap();
        let file = invocation
            .args
            .last()
            .and_then(|last| fs::read(last).ok());
        state.invocations.push(invocation.clone());
        state.files.push(file);

        let rendered = invocation.to_string();
        if let Some((_, result)) = state
            .rules
            .iter()
            .find(|(pattern, _)| rendered.contains(pattern.as_str()))
        {
            return clone_result(result);
        }
        state
            .queue
            .pop_front()
            .unwrap_or_else(|| Ok(CommandResult::ok("")))
    }
}

struct UsbEntry {
    port: String,
    identity: Option<UsbIdentity>,
    hidden_passes: usize,
}

#[derive(Default)]
struct UsbState {
    entries: Vec<UsbEntry>,
    passes: usize,
}

/// Enumeration source with devices that can appear late or vanish.
#[derive(Clone, Default)]
pub struct FakeUsbSource {
    state: Arc<Mutex<UsbState>>,
}

impl FakeUsbSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, port: &str, identity: Option<UsbIdentity>, hidden_passes: usize) {
        self.state.lock().unwrap().entries.push(UsbEntry {
            port: port.to_string(),
            identity,
            hidden_passes,
        });
    }

    pub fn add(&self, port: &str, identity: UsbIdentity) {
        self.insert(port, Some(identity), 0);
    }

    /// Device only listed from pass `passes + 1` on.
    pub fn appear_after(&self, passes: usize, port: &str, identity: UsbIdentity) {
        let base = self.state.lock().unwrap().passes;
        self.insert(port, Some(identity), base + passes);
    }

    /// Device whose metadata read always fails.
    pub fn add_unreadable(&self, port: &str) {
        self.insert(port, None, 0);
    }

    pub fn remove(&self, port: &str) {
        self.state.lock().unwrap().entries.retain(|e| e.port != port);
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().entries.clear();
    }

    /// Number of enumeration passes so far.
    pub fn passes(&self) -> usize {
        self.state.lock().unwrap().passes
    }
}

impl UsbSource for FakeUsbSource {
    fn candidates(&self) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        state.passes += 1;
        let pass = state.passes;
        state
            .entries
            .iter()
            .filter(|e| pass > e.hidden_passes)
            .map(|e| e.port.clone())
            .collect()
    }

    fn identity_of(&self, port: &str) -> io::Result<UsbIdentity> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .find(|e| e.port == port)
            .and_then(|e| e.identity.clone())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no idVendor"))
    }
}

#[derive(Default)]
struct StorageState {
    mount_table: String,
    devices: Vec<BlockDevice>,
    mount_targets: HashMap<String, String>,
    mounted: Vec<String>,
    lsblk_calls: usize,
}

/// In-memory mount table and block-device tree.
#[derive(Clone, Default)]
pub struct FakeStorage {
    state: Arc<Mutex<StorageState>>,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mount_table(&self, table: &str) {
        self.state.lock().unwrap().mount_table = table.to_string();
    }

    /// Mount `mount_point` as a vfat volume of `/dev/<name>`.
    pub fn add_mount(&self, name: &str, mount_point: &str) {
        let mut state = self.state.lock().unwrap();
        let line = format!("/dev/{name} {mount_point} vfat rw 0 0\n");
        state.mount_table.push_str(&line);
    }

    pub fn set_block_devices(&self, devices: Vec<BlockDevice>) {
        self.state.lock().unwrap().devices = devices;
    }

    /// Make a mount request for `name` succeed at `mount_point`.
    pub fn mount_to(&self, name: &str, mount_point: &str) {
        self.state
            .lock()
            .unwrap()
            .mount_targets
            .insert(name.to_string(), mount_point.to_string());
    }

    /// Device names a mount was requested for.
    pub fn mounted(&self) -> Vec<String> {
        self.state.lock().unwrap().mounted.clone()
    }

    pub fn lsblk_calls(&self) -> usize {
        self.state.lock().unwrap().lsblk_calls
    }
}

impl StorageSource for FakeStorage {
    fn mount_table(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().mount_table.clone())
    }

    fn block_devices(&self) -> Result<Vec<BlockDevice>> {
        let mut state = self.state.lock().unwrap();
        state.lsblk_calls += 1;
        Ok(state.devices.clone())
    }

    fn mount(&self, device: &BlockDevice) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mounted.push(device.name.clone());
        match state.mount_targets.get(&device.name).cloned() {
            Some(mount_point) => {
                let line = format!("/dev/{} {mount_point} vfat rw 0 0\n", device.name);
                state.mount_table.push_str(&line);
                Ok(())
            },
            None => Err(Error::CommandFailed {
                command: format!("udisksctl mount -b /dev/{}", device.name),
                output: "Error mounting: not authorized".to_string(),
            }),
        }
    }
}

#[derive(Default)]
struct MockPortState {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    replies: Vec<(String, Vec<u8>, bool)>,
}

/// Serial port with scripted replies.
#[derive(Clone)]
pub struct MockPort {
    name: String,
    timeout: Duration,
    chunk: usize,
    state: Arc<Mutex<MockPortState>>,
}

impl MockPort {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            timeout: Duration::from_millis(100),
            chunk: usize::MAX,
            state: Arc::default(),
        }
    }

    /// Return at most `chunk` bytes per read.
    pub fn with_chunk_size(mut self, chunk: usize) -> Self {
        self.chunk = chunk;
        self
    }

    /// Make bytes available to read.
    pub fn feed(&self, text: &str) {
        self.state.lock().unwrap().rx.extend(text.as_bytes());
    }

    /// Feed `response` once the written bytes contain `trigger`.
    pub fn reply_to(&self, trigger: &str, response: &str) {
        self.state.lock().unwrap().replies.push((
            trigger.to_string(),
            response.as_bytes().to_vec(),
            false,
        ));
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().tx.clone()
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"));
        }
        let n = buf.len().min(state.rx.len()).min(self.chunk);
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.tx.extend_from_slice(buf);
        let written = String::from_utf8_lossy(&state.tx).into_owned();
        let mut fired = Vec::new();
        for (trigger, response, done) in &mut state.replies {
            if !*done && written.contains(trigger.as_str()) {
                *done = true;
                fired.extend_from_slice(response);
            }
        }
        state.rx.extend(fired);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn bytes_to_read(&self) -> Result<u32> {
        Ok(self.state.lock().unwrap().rx.len() as u32)
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.state.lock().unwrap().rx.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Opener handing out registered [`MockPort`]s by name.
#[derive(Clone, Default)]
pub struct MockOpener {
    ports: Arc<Mutex<HashMap<String, MockPort>>>,
    opened: Arc<Mutex<Vec<String>>>,
}

impl MockOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, port: MockPort) {
        self.ports
            .lock()
            .unwrap()
            .insert(port.name.clone(), port);
    }

    /// Names opened so far.
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

impl PortOpener for MockOpener {
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>> {
        self.opened.lock().unwrap().push(config.port_name.clone());
        match self.ports.lock().unwrap().get(&config.port_name) {
            Some(port) => Ok(Box::new(port.clone())),
            None => Err(Error::DeviceNotFound(config.port_name.clone())),
        }
    }
}

/// Scratch directory standing in for a mounted volume.
pub fn scratch_volume(label: &str) -> (tempfile::TempDir, PathBuf) {
    let root = tempfile::tempdir().unwrap();
    let mount = root.path().join(label);
    fs::create_dir_all(&mount).unwrap();
    (root, mount)
}
