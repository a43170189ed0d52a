//! Simulated brick state backing the mock transport: four sensor ports,
//! four motor ports, the brick's own settings, and a small file tree.

use std::collections::BTreeMap;
use std::f32::consts::TAU;
use std::sync::{Arc, Mutex};

use log::debug;
use md5::{Digest, Md5};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const SENSOR_PORT_COUNT: usize = 4;
pub const MOTOR_PORT_COUNT: usize = 4;
pub const MAX_BRICK_NAME: usize = 12;

/// EV3 device type codes used by the simulated sensors and motors.
pub mod type_codes {
    pub const LARGE_MOTOR: u8 = 7;
    pub const MEDIUM_MOTOR: u8 = 8;
    pub const TOUCH: u8 = 16;
    pub const COLOR: u8 = 29;
    pub const ULTRASONIC: u8 = 30;
    pub const GYRO: u8 = 32;
    pub const NONE: u8 = 126;
}

/// How a simulated sensor produces values over time.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueGenerator {
    Constant {
        value: f32,
    },
    Sine {
        min: f32,
        max: f32,
        period_ms: u32,
    },
    RandomWalk {
        min: f32,
        max: f32,
        step_size: f32,
    },
    Step {
        values: Vec<f32>,
        interval_ms: u32,
    },
}

impl Default for ValueGenerator {
    fn default() -> Self {
        Self::Constant { value: 0.0 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockSensorState {
    pub type_code: u8,
    pub mode: u8,
    pub generator: ValueGenerator,
    /// Position of a random walk; ignored by the other generator kinds.
    walk_value: f32,
}

impl MockSensorState {
    pub fn new(type_code: u8, mode: u8, generator: ValueGenerator) -> Self {
        let walk_value = match &generator {
            ValueGenerator::RandomWalk { min, max, .. } => (min + max) / 2.0,
            _ => 0.0,
        };
        Self {
            type_code,
            mode,
            generator,
            walk_value,
        }
    }

    /// Current reading at `clock_ms` world time.
    pub fn value(&self, clock_ms: u64) -> f32 {
        match &self.generator {
            ValueGenerator::Constant { value } => *value,
            ValueGenerator::Sine { min, max, period_ms } => {
                if *period_ms == 0 {
                    return (min + max) / 2.0;
                }
                let mid = (min + max) / 2.0;
                let amplitude = (max - min) / 2.0;
                let t = (clock_ms % u64::from(*period_ms)) as f32 / *period_ms as f32;
                mid + amplitude * (TAU * t).sin()
            }
            ValueGenerator::RandomWalk { .. } => self.walk_value,
            ValueGenerator::Step { values, interval_ms } => {
                if values.is_empty() {
                    return 0.0;
                }
                if *interval_ms == 0 {
                    return values[0];
                }
                let index = (clock_ms / u64::from(*interval_ms)) as usize % values.len();
                values[index]
            }
        }
    }

    fn tick(&mut self, rng: &mut StdRng) {
        if let ValueGenerator::RandomWalk { min, max, step_size } = &self.generator {
            let step = rng.random_range(-step_size..=*step_size);
            self.walk_value = (self.walk_value + step).clamp(*min, *max);
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockMotorState {
    pub type_code: u8,
    /// Commanded speed in percent, clamped to `[-100, 100]`.
    speed: i8,
    pub running: bool,
    tacho_degrees: f64,
}

impl Default for MockMotorState {
    fn default() -> Self {
        Self {
            type_code: type_codes::LARGE_MOTOR,
            speed: 0,
            running: false,
            tacho_degrees: 0.0,
        }
    }
}

impl MockMotorState {
    pub fn speed(&self) -> i8 {
        self.speed
    }

    pub fn set_speed(&mut self, speed: i32) {
        self.speed = speed.clamp(-100, 100) as i8;
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    /// Braking zeroes the commanded speed; coasting keeps it so a later
    /// start resumes at the old speed.
    pub fn stop(&mut self, brake: bool) {
        self.running = false;
        if brake {
            self.speed = 0;
        }
    }

    pub fn reset(&mut self) {
        self.tacho_degrees = 0.0;
    }

    pub fn tacho_degrees(&self) -> i32 {
        self.tacho_degrees as i32
    }

    fn tick(&mut self, elapsed_ms: u64) {
        if self.running {
            // Full speed turns 1000 degrees per second.
            let deg_per_sec = f64::from(self.speed) / 100.0 * 1000.0;
            self.tacho_degrees += deg_per_sec * elapsed_ms as f64 / 1000.0;
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockBrickState {
    name: String,
    pub firmware_version: String,
    pub battery_voltage: f32,
    pub battery_current: f32,
    volume: u8,
    pub sleep_minutes: u32,
    pub led_pattern: u8,
    pub button_bits: u8,
}

impl Default for MockBrickState {
    fn default() -> Self {
        Self {
            name: "EV3".to_string(),
            firmware_version: "V1.09H".to_string(),
            battery_voltage: 7.9,
            battery_current: 0.2,
            volume: 50,
            sleep_minutes: 30,
            led_pattern: 1,
            button_bits: 0,
        }
    }
}

impl MockBrickState {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Brick names are at most twelve characters; longer ones are cut the
    /// way the firmware cuts them.
    pub fn set_name(&mut self, name: &str) {
        self.name = name.chars().take(MAX_BRICK_NAME).collect();
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: i32) {
        self.volume = volume.clamp(0, 100) as u8;
    }

    /// Battery charge as a rough percentage of the usable voltage band.
    pub fn battery_level(&self) -> u8 {
        let level = (self.battery_voltage - 5.5) / (8.3 - 5.5) * 100.0;
        level.clamp(0.0, 100.0) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsNode {
    Dir { children: BTreeMap<String, FsNode> },
    File { bytes: Vec<u8> },
}

impl FsNode {
    fn dir() -> Self {
        Self::Dir {
            children: BTreeMap::new(),
        }
    }
}

/// Simulated brick filesystem. Paths are normalised the way the command
/// layer sends them: backslashes become slashes, a leading slash is
/// enforced, trailing slashes are trimmed.
#[derive(Debug, Clone)]
pub struct MockFsTree {
    root: FsNode,
}

impl Default for MockFsTree {
    fn default() -> Self {
        Self { root: FsNode::dir() }
    }
}

pub fn normalize_path(path: &str) -> String {
    let mut normalized = path.replace('\\', "/");
    while normalized.ends_with('/') {
        normalized.pop();
    }
    if !normalized.starts_with('/') {
        normalized.insert(0, '/');
    }
    normalized
}

fn segments(path: &str) -> Vec<String> {
    normalize_path(path)
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl MockFsTree {
    pub fn node(&self, path: &str) -> Option<&FsNode> {
        let mut node = &self.root;
        for segment in segments(path) {
            match node {
                FsNode::Dir { children } => node = children.get(&segment)?,
                FsNode::File { .. } => return None,
            }
        }
        Some(node)
    }

    pub fn file_bytes(&self, path: &str) -> Option<&[u8]> {
        match self.node(path)? {
            FsNode::File { bytes } => Some(bytes),
            FsNode::Dir { .. } => None,
        }
    }

    /// Creates the directory and any missing parents. Fails when a file is
    /// in the way.
    pub fn create_dir(&mut self, path: &str) -> bool {
        let mut node = &mut self.root;
        for segment in segments(path) {
            match node {
                FsNode::Dir { children } => {
                    node = children.entry(segment).or_insert_with(FsNode::dir);
                }
                FsNode::File { .. } => return false,
            }
        }
        matches!(node, FsNode::Dir { .. })
    }

    /// Writes a file, creating parent directories as the brick does during
    /// a download.
    pub fn write_file(&mut self, path: &str, bytes: Vec<u8>) -> bool {
        let segments = segments(path);
        let Some((name, parents)) = segments.split_last() else {
            return false;
        };
        let mut node = &mut self.root;
        for segment in parents {
            match node {
                FsNode::Dir { children } => {
                    node = children.entry(segment.clone()).or_insert_with(FsNode::dir);
                }
                FsNode::File { .. } => return false,
            }
        }
        match node {
            FsNode::Dir { children } => {
                if matches!(children.get(name), Some(FsNode::Dir { .. })) {
                    return false;
                }
                children.insert(name.clone(), FsNode::File { bytes });
                true
            }
            FsNode::File { .. } => false,
        }
    }

    /// Removes a file or an entire directory subtree.
    pub fn delete(&mut self, path: &str) -> bool {
        let segments = segments(path);
        let Some((name, parents)) = segments.split_last() else {
            return false;
        };
        let mut node = &mut self.root;
        for segment in parents {
            match node {
                FsNode::Dir { children } => match children.get_mut(segment) {
                    Some(child) => node = child,
                    None => return false,
                },
                FsNode::File { .. } => return false,
            }
        }
        match node {
            FsNode::Dir { children } => children.remove(name).is_some(),
            FsNode::File { .. } => false,
        }
    }

    /// Directory listing in the brick's own format: `NAME/` lines for
    /// directories, `MD5 HEXSIZE NAME` lines for files.
    pub fn list(&self, path: &str) -> Option<String> {
        let FsNode::Dir { children } = self.node(path)? else {
            return None;
        };
        let mut listing = String::new();
        for (name, node) in children {
            match node {
                FsNode::Dir { .. } => {
                    listing.push_str(name);
                    listing.push_str("/\n");
                }
                FsNode::File { bytes } => {
                    let digest = Md5::digest(bytes);
                    let mut line = String::with_capacity(name.len() + 44);
                    for byte in digest {
                        line.push_str(&format!("{byte:02X}"));
                    }
                    line.push_str(&format!(" {:08X} {name}\n", bytes.len()));
                    listing.push_str(&line);
                }
            }
        }
        Some(listing)
    }
}

/// The whole simulated brick. Built deterministically from a seed;
/// [`MockWorldHandle::reset`] rebuilds the same initial state.
#[derive(Debug)]
pub struct MockWorld {
    pub sensors: [MockSensorState; SENSOR_PORT_COUNT],
    pub motors: [MockMotorState; MOTOR_PORT_COUNT],
    pub brick: MockBrickState,
    pub fs: MockFsTree,
    seed: u64,
    clock_ms: u64,
    rng: StdRng,
}

impl MockWorld {
    pub fn new(seed: u64) -> Self {
        let sensors = [
            MockSensorState::new(
                type_codes::TOUCH,
                0,
                ValueGenerator::Step {
                    values: vec![0.0, 1.0],
                    interval_ms: 2000,
                },
            ),
            MockSensorState::new(
                type_codes::COLOR,
                0,
                ValueGenerator::Constant { value: 3.0 },
            ),
            MockSensorState::new(
                type_codes::ULTRASONIC,
                0,
                ValueGenerator::Sine {
                    min: 5.0,
                    max: 120.0,
                    period_ms: 4000,
                },
            ),
            MockSensorState::new(
                type_codes::GYRO,
                0,
                ValueGenerator::RandomWalk {
                    min: -180.0,
                    max: 180.0,
                    step_size: 4.0,
                },
            ),
        ];
        let mut fs = MockFsTree::default();
        fs.create_dir("/home/root/lms2012/prjs/SD_Card");
        fs.create_dir("/home/root/lms2012/apps");
        fs.write_file(
            "/home/root/lms2012/prjs/demo/demo.rbf",
            b"LEGO mock program image".to_vec(),
        );
        Self {
            sensors,
            motors: Default::default(),
            brick: MockBrickState::default(),
            fs,
            seed,
            clock_ms: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn clock_ms(&self) -> u64 {
        self.clock_ms
    }

    /// Advances simulated time: motors integrate their tacho counts and
    /// random-walk sensors take one step.
    pub fn tick(&mut self, elapsed_ms: u64) {
        self.clock_ms += elapsed_ms;
        for motor in &mut self.motors {
            motor.tick(elapsed_ms);
        }
        for sensor in &mut self.sensors {
            sensor.tick(&mut self.rng);
        }
    }

    pub fn sensor_value(&self, port: usize) -> f32 {
        self.sensors
            .get(port)
            .map(|sensor| sensor.value(self.clock_ms))
            .unwrap_or(0.0)
    }
}

/// Shared handle through which the responder and tests see one world.
/// `reset` swaps in a freshly built world in one step, so a concurrent
/// reader never observes a half-reset state.
#[derive(Clone)]
pub struct MockWorldHandle {
    inner: Arc<Mutex<MockWorld>>,
}

impl MockWorldHandle {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockWorld::new(seed))),
        }
    }

    /// Runs `f` with exclusive access to the world.
    pub fn with<T>(&self, f: impl FnOnce(&mut MockWorld) -> T) -> T {
        let mut guard = self.inner.lock().expect("mock world lock poisoned");
        f(&mut guard)
    }

    pub fn tick(&self, elapsed_ms: u64) {
        self.with(|world| world.tick(elapsed_ms));
    }

    pub fn reset(&self) {
        let mut guard = self.inner.lock().expect("mock world lock poisoned");
        let seed = guard.seed();
        debug!("resetting mock world from seed {seed}");
        *guard = MockWorld::new(seed);
    }
}
