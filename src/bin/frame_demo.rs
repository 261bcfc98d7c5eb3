//! Frame simulation CLI.
//!
//! Drives the scheduler the way a renderer does: every frame culls a scene
//! with `parallel_for`, then records one command batch per visible chunk as
//! child tasks of a frame root, allocating batch scratch from a per-frame
//! arena through the context-allocator stack.
//!
//! ```bash
//! cargo run --release --bin frame-demo -- --frames 120 --objects 200000
//! RUST_LOG=frame_scheduler=debug ./target/release/frame-demo -t 4
//! ```

use std::alloc::Layout;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use frame_scheduler::{
    current_allocator, AllocatorHandle, AllocatorScope, FrameArena, Scheduler, SchedulerConfig,
    TaskContext,
};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Argument Parsing
// ============================================================================

#[derive(Debug)]
struct Args {
    threads: Option<usize>,
    frames: usize,
    objects: usize,
    block: Option<usize>,
    batch: usize,
    arena_bytes: usize,
    seed: u64,
    help: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            threads: None,
            frames: 60,
            objects: 100_000,
            block: None,
            batch: 1024,
            arena_bytes: 8 * 1024 * 1024,
            seed: 0x5EED,
            help: false,
        }
    }
}

fn die(msg: &str) -> ! {
    eprintln!("Error: {msg}");
    eprintln!("Run with --help for usage");
    std::process::exit(2);
}

fn next_value(it: &mut impl Iterator<Item = String>, flag: &str) -> String {
    it.next()
        .unwrap_or_else(|| die(&format!("{flag} requires a value")))
}

fn parse_num<T: std::str::FromStr>(val: &str, flag: &str) -> T {
    val.parse()
        .unwrap_or_else(|_| die(&format!("Invalid {flag}: '{val}'")))
}

fn parse_positive(it: &mut impl Iterator<Item = String>, flag: &str) -> usize {
    let n: usize = parse_num(&next_value(it, flag), flag);
    if n == 0 {
        die(&format!("{flag} must be >= 1"));
    }
    n
}

fn parse_args() -> Args {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);

    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--help" | "-h" => args.help = true,
            "--threads" | "-t" => args.threads = Some(parse_positive(&mut it, "--threads")),
            "--frames" | "-f" => args.frames = parse_positive(&mut it, "--frames"),
            "--objects" | "-n" => args.objects = parse_positive(&mut it, "--objects"),
            "--block" => args.block = Some(parse_positive(&mut it, "--block")),
            "--batch" => args.batch = parse_positive(&mut it, "--batch"),
            "--arena-bytes" => args.arena_bytes = parse_positive(&mut it, "--arena-bytes"),
            "--seed" => {
                let val = next_value(&mut it, "--seed");
                args.seed = parse_num(&val, "--seed");
            }
            other => die(&format!("Unknown argument: '{other}'")),
        }
    }
    args
}

fn print_help() {
    println!(
        "frame-demo: simulate frames of culling and command recording

USAGE:
    frame-demo [OPTIONS]

OPTIONS:
    -t, --threads <N>       Worker threads, including the main thread
                            [default: FRAME_SCHED_THREADS or core count]
    -f, --frames <N>        Frames to simulate [default: 60]
    -n, --objects <N>       Scene objects [default: 100000]
        --block <N>         Culling block size [default: FRAME_SCHED_MIN_BLOCK or 64]
        --batch <N>         Objects per command batch [default: 1024]
        --arena-bytes <N>   Per-frame arena size [default: 8388608]
        --seed <N>          Scene seed [default: 24301]
    -h, --help              Print this help

Logging is controlled by RUST_LOG (e.g. RUST_LOG=frame_scheduler=debug)."
    );
}

// ============================================================================
// Scene
// ============================================================================

#[derive(Clone, Copy, Debug)]
struct Sphere {
    center: [f32; 3],
    radius: f32,
}

struct Scene {
    objects: Vec<Sphere>,
    visible: Vec<AtomicBool>,
}

impl Scene {
    fn generate(count: usize, seed: u64) -> Self {
        let mut state = seed | 1;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 40) as f32 / (1u64 << 24) as f32
        };
        let objects = (0..count)
            .map(|_| Sphere {
                center: [next() * 200.0 - 100.0, next() * 200.0 - 100.0, next() * 200.0],
                radius: 0.5 + next() * 2.0,
            })
            .collect();
        let visible = (0..count).map(|_| AtomicBool::new(false)).collect();
        Self { objects, visible }
    }
}

/// Camera looking down +z with a symmetric frustum that sways per frame.
#[derive(Clone, Copy, Debug)]
struct Camera {
    x: f32,
    half_fov_tan: f32,
    far: f32,
}

impl Camera {
    fn for_frame(frame: usize) -> Self {
        Self {
            x: ((frame as f32) * 0.05).sin() * 40.0,
            half_fov_tan: 0.6,
            far: 150.0,
        }
    }

    fn sees(&self, s: &Sphere) -> bool {
        let [x, y, z] = s.center;
        let (x, r) = (x - self.x, s.radius);
        if z + r < 0.0 || z - r > self.far {
            return false;
        }
        let extent = z.max(0.0) * self.half_fov_tan + r;
        x.abs() <= extent && y.abs() <= extent
    }
}

// ============================================================================
// Frame
// ============================================================================

#[derive(Default)]
struct FrameStats {
    visible: AtomicU64,
    commands_checksum: AtomicU64,
}

/// Records one batch: allocates a command buffer from the current allocator
/// and encodes one command per visible object.
fn record_batch(scene: &Scene, start: usize, end: usize, stats: &FrameStats) {
    let alloc = current_allocator();
    let Ok(layout) = Layout::array::<u64>(end - start) else {
        return;
    };
    let Some(buf) = alloc.allocate(layout) else {
        tracing::warn!(allocator = alloc.name(), "frame arena exhausted; batch skipped");
        return;
    };
    let cmds = buf.cast::<u64>().as_ptr();

    let mut n = 0usize;
    for (i, obj) in scene.objects[start..end].iter().enumerate() {
        if scene.visible[start + i].load(Ordering::Relaxed) {
            let depth = (obj.center[2] * 256.0) as u64;
            // SAFETY: n < end - start, the buffer's element count.
            unsafe { cmds.add(n).write((depth << 32) | (start + i) as u64) };
            n += 1;
        }
    }

    let mut checksum = 0u64;
    for k in 0..n {
        // SAFETY: the first n elements were written above.
        checksum = checksum.wrapping_add(unsafe { cmds.add(k).read() });
    }
    // SAFETY: allocated above from `alloc` with `layout`.
    unsafe { alloc.deallocate(buf, layout) };

    stats.visible.fetch_add(n as u64, Ordering::Relaxed);
    stats.commands_checksum.fetch_add(checksum, Ordering::Relaxed);
}

fn run_frame(
    sched: &mut Scheduler,
    scene: &Arc<Scene>,
    arena: &AllocatorHandle,
    frame: usize,
    args: &Args,
) -> Arc<FrameStats> {
    let camera = Camera::for_frame(frame);

    let cull_scene = Arc::clone(scene);
    let cull = sched.parallel_for(scene.objects.len(), args.block, move |i| {
        let seen = camera.sees(&cull_scene.objects[i]);
        cull_scene.visible[i].store(seen, Ordering::Relaxed);
    });
    sched.run_and_wait(cull);

    let stats = Arc::new(FrameStats::default());
    let (rec_scene, rec_stats, rec_arena) =
        (Arc::clone(scene), Arc::clone(&stats), arena.clone());
    let batch = args.batch;
    let record = sched.submit_task(
        move |ctx: &TaskContext<'_>| {
            let total = rec_scene.objects.len();
            for start in (0..total).step_by(batch) {
                let end = (start + batch).min(total);
                let (scene, stats, arena) = (
                    Arc::clone(&rec_scene),
                    Arc::clone(&rec_stats),
                    rec_arena.clone(),
                );
                ctx.spawn(move |_| {
                    let _scope = AllocatorScope::enter(arena);
                    record_batch(&scene, start, end, &stats);
                });
            }
        },
        None,
    );
    sched.run_and_wait(record);
    stats
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = parse_args();
    if args.help {
        print_help();
        return;
    }

    let mut config = SchedulerConfig::from_env().unwrap_or_else(|e| die(&e.to_string()));
    if let Some(t) = args.threads {
        config.thread_count = t;
    }
    let mut sched = Scheduler::new(config).unwrap_or_else(|e| die(&e.to_string()));

    let scene = Arc::new(Scene::generate(args.objects, args.seed));
    let arena = Arc::new(FrameArena::with_capacity("frame", args.arena_bytes));
    let arena_handle = AllocatorHandle::from_arc(arena.clone());

    println!(
        "frame-demo: threads={} objects={} frames={}",
        sched.thread_count(),
        args.objects,
        args.frames
    );

    let mut total = Duration::ZERO;
    let mut worst = Duration::ZERO;
    let mut visible = 0u64;
    let mut checksum = 0u64;
    for frame in 0..args.frames {
        let t0 = Instant::now();
        let stats = run_frame(&mut sched, &scene, &arena_handle, frame, &args);
        let dt = t0.elapsed();

        total += dt;
        worst = worst.max(dt);
        visible += stats.visible.load(Ordering::Relaxed);
        checksum = checksum.wrapping_add(stats.commands_checksum.load(Ordering::Relaxed));
        tracing::debug!(frame, ?dt, arena_used = arena.used(), "frame done");
        arena.reset();
    }

    let frames = args.frames as u32;
    println!(
        "avg frame {:?}, worst {:?}, avg visible {}, checksum {:#x}",
        total / frames,
        worst,
        visible / args.frames as u64,
        checksum
    );
    println!("{}", sched.shutdown());
}
