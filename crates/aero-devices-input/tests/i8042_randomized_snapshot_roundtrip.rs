use std::rc::Rc;

use aero_devices_input::{cmd, i8042_init, I8042};
use aero_devmodel::DeviceModel;
use aero_io_snapshot::io::state::IoSnapshot;
use aero_platform::interrupts::LevelLatch;
use aero_platform::memory::MemoryRegion;

/// SplitMix64; deterministic so a failing seed can be replayed.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    fn byte(&mut self) -> u8 {
        self.next() as u8
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }

    fn pick(&mut self, from: &[u8]) -> u8 {
        from[self.below(from.len())]
    }

    /// Mostly one of `likely`, sometimes any byte at all.
    fn biased(&mut self, likely: &[u8]) -> u8 {
        if self.below(8) == 0 {
            self.byte()
        } else {
            self.pick(likely)
        }
    }

    fn delta(&mut self, span: i32) -> i32 {
        self.below(2 * span as usize + 1) as i32 - span
    }
}

const COMMANDS: &[u8] = &[
    cmd::READ_MODE,
    cmd::WRITE_MODE,
    cmd::MOUSE_DISABLE,
    cmd::MOUSE_ENABLE,
    cmd::TEST_MOUSE,
    cmd::SELF_TEST,
    cmd::KBD_TEST,
    cmd::KBD_DISABLE,
    cmd::KBD_ENABLE,
    cmd::READ_OUTPORT,
    cmd::WRITE_OUTPORT,
    cmd::WRITE_OBUF,
    cmd::WRITE_AUX_OBUF,
    cmd::WRITE_MOUSE,
    cmd::DISABLE_A20,
    cmd::ENABLE_A20,
    cmd::PULSE_BITS_3_0,
    cmd::RESET,
];

/// Keyboard and mouse commands (several take an argument byte) plus typical arguments.
const DATA: &[u8] = &[
    0xE6, 0xE7, 0xE8, 0xE9, 0xEA, 0xEB, 0xEC, 0xED, 0xEE, 0xF0, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6, 0xFF,
    0x00, 0x01, 0x02, 0x03, 0x43, 0x47, 0x64, 0xC8,
];

/// Set-2 make codes; extended keys get an E0 prefix.
const KEYS: &[u8] = &[0x1C, 0x32, 0x21, 0x29, 0x5A, 0x76, 0x75, 0x72, 0x6B, 0x74];

#[derive(Debug, Clone)]
enum Op {
    Command(u8),
    Data(u8),
    ReadData,
    ReadStatus,
    Keys(Vec<u8>),
    Mouse { dx: i32, dy: i32, dz: i32, buttons: u8 },
    FakeMouse,
    Reset,
}

impl Op {
    fn random(rng: &mut Rng) -> Self {
        match rng.below(100) {
            0..=19 => Self::Command(rng.biased(COMMANDS)),
            20..=39 => Self::Data(rng.biased(DATA)),
            40..=54 => Self::ReadData,
            55..=64 => Self::ReadStatus,
            65..=82 => {
                let key = rng.pick(KEYS);
                Self::Keys(match rng.below(4) {
                    0 => vec![key],
                    1 => vec![0xF0, key],
                    2 => vec![0xE0, key],
                    _ => (0..=rng.below(4)).map(|_| rng.byte()).collect(),
                })
            }
            83..=92 => Self::Mouse {
                dx: rng.delta(200),
                dy: rng.delta(200),
                dz: rng.delta(16),
                buttons: rng.byte() & 0x1F,
            },
            93..=96 => Self::FakeMouse,
            _ => Self::Reset,
        }
    }
}

struct Machine {
    _model: DeviceModel,
    io: MemoryRegion,
    ctrl: I8042,
}

impl Machine {
    fn new() -> Self {
        let model = DeviceModel::new();
        let io = MemoryRegion::new_container("io", 0x1_0000);
        let line = || Rc::new(LevelLatch::new());
        let ctrl = i8042_init(&model, &io, line(), line(), line()).unwrap();
        Self {
            _model: model,
            io,
            ctrl,
        }
    }

    fn restored_from(snapshot: &[u8]) -> Self {
        let mut m = Self::new();
        m.ctrl.load_state(snapshot).unwrap();
        m
    }

    fn apply(&self, op: &Op) -> Option<u8> {
        match op {
            Op::Command(v) => self.io.write_u8(0x64, *v),
            Op::Data(v) => self.io.write_u8(0x60, *v),
            Op::ReadData => return Some(self.io.read_u8(0x60)),
            Op::ReadStatus => return Some(self.io.read_u8(0x64)),
            Op::Keys(bytes) => self.ctrl.keyboard().put_keycodes(bytes),
            Op::Mouse {
                dx,
                dy,
                dz,
                buttons,
            } => self.ctrl.mouse().mouse_event(*dx, *dy, *dz, *buttons),
            Op::FakeMouse => self.ctrl.mouse_fake_event(),
            Op::Reset => self.ctrl.reset(),
        }
        None
    }

    /// Everything a guest or the board can observe without side effects.
    fn observe(&self) -> (u8, bool, bool, u8) {
        (
            self.ctrl.read_status(),
            self.ctrl.irq_kbd().level(),
            self.ctrl.irq_mouse().level(),
            self.ctrl.mouse().buttons(),
        )
    }
}

#[test]
fn i8042_randomized_snapshot_restore_produces_equivalent_controller() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    const SEED: u64 = 0x00C0_FFEE_8042_1234;
    const STEPS: usize = 10_000;
    const CHECKPOINT_EVERY: usize = 2_500;

    let mut rng = Rng(SEED);
    let live = Machine::new();
    let mut shadow: Option<Machine> = None;

    for step in 0..STEPS {
        if step % CHECKPOINT_EVERY == CHECKPOINT_EVERY / 2 {
            let snap = live.ctrl.save_state();
            if let Some(prev) = &shadow {
                assert_eq!(prev.ctrl.save_state(), snap, "seed={SEED:#x} step={step} drifted");
            }
            let restored = Machine::restored_from(&snap);
            assert_eq!(restored.ctrl.save_state(), snap, "seed={SEED:#x} step={step}");
            shadow = Some(restored);
        }

        let op = Op::random(&mut rng);
        let read = live.apply(&op);
        let Some(shadow) = &shadow else { continue };
        assert_eq!(shadow.apply(&op), read, "seed={SEED:#x} step={step} op={op:?}");
        assert_eq!(shadow.observe(), live.observe(), "seed={SEED:#x} step={step} op={op:?}");
    }

    let shadow = shadow.unwrap();
    assert_eq!(shadow.ctrl.save_state(), live.ctrl.save_state());
}

#[test]
fn i8042_snapshot_rejects_a_foreign_device_id() {
    let mut bytes = Machine::new().ctrl.save_state();
    let mut other = Machine::new();
    other.io.write_u8(0x64, cmd::SELF_TEST);
    let before = other.ctrl.save_state();

    // Byte 8 starts the device id.
    bytes[8] ^= 0xFF;
    assert!(other.ctrl.load_state(&bytes).is_err());
    assert_eq!(other.ctrl.save_state(), before);
}
