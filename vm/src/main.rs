use clap::Parser as ClapParser;
use std::{
    process,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use bytecode::{BasicType, BytecodeBuilder, Op};
use vm::{
    BumpAllocator, CompileBroker, CompiledCode, ConstantPoolCache,
    ConstantValue, Dispatch, DynamicLink, FieldLink, KlassId, Method,
    MethodFlags, MethodId, MethodLink, MonitorTable, ObjectRef, Observation,
    Outcome, RuntimeCreateInfo, Signature, StaticLinker, VM, VMCreateInfo,
    VmResult,
};

const HOLDER: KlassId = KlassId(1);
/// Bci of the back-edge closing the worker loop.
const LOOP_BRANCH_BCI: usize = 15;

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
/// Drive the slow-path runtime from several threads at once and report
/// what the shared caches did.
struct Cli {
    /// Number of mutator threads
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Loop iterations per thread
    #[arg(long, default_value_t = 20_000)]
    iterations: usize,

    /// Signature handler blob size in bytes
    #[arg(long)]
    blob_size: Option<usize>,

    /// Do not collapse equivalent signature fingerprints
    #[arg(long)]
    no_normalize: bool,

    /// Invocation count that triggers a compile request
    #[arg(long)]
    invocation_threshold: Option<u32>,

    /// Back-edge count that triggers an overflow (OSR at twice this)
    #[arg(long)]
    backedge_threshold: Option<u32>,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

struct Program {
    worker: Arc<Method>,
    natives: Vec<Arc<Method>>,
    lock: Option<ObjectRef>,
    sites: Vec<usize>,
}

#[derive(Debug, Default)]
struct WorkerReport {
    published: usize,
    discarded: usize,
    cached: usize,
    osr_entries: usize,
    safepoints: usize,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level),
    )
    .init();

    let linker = Arc::new(StaticLinker::new());
    let broker = Arc::new(CompileBroker::new());
    let monitors = Arc::new(MonitorTable::new());
    let allocator = Arc::new(BumpAllocator::new(64 << 20));

    let mut info = VMCreateInfo::new(
        linker.clone(),
        allocator.clone(),
        monitors.clone(),
        broker.clone(),
    );
    info.runtime = RuntimeCreateInfo {
        blob_size: cli.blob_size,
        normalize_fingerprints: cli.no_normalize.then_some(false),
        invocation_threshold: cli.invocation_threshold,
        backedge_threshold: cli.backedge_threshold,
        osr_threshold: cli.backedge_threshold.map(|t| t.saturating_mul(2)),
        ..Default::default()
    };
    let vm = match VM::new(info) {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(1);
        }
    };

    let program = build_program(&linker);
    let started = Instant::now();
    let stop_compiler = AtomicBool::new(false);
    let running = AtomicBool::new(true);

    let (reports, compiled, safepoints) = thread::scope(|s| {
        let compiler = s.spawn(|| run_compiler(&broker, &stop_compiler));

        let workers: Vec<_> = (0..cli.threads)
            .map(|_| s.spawn(|| run_worker(&vm, &program, cli.iterations)))
            .collect();

        let safepoints = s.spawn(|| {
            let mut count = 0;
            while running.load(Ordering::Acquire) {
                drop(vm.safepoints().synchronize());
                count += 1;
                thread::sleep(Duration::from_millis(2));
            }
            count
        });

        let reports: Vec<_> = workers
            .into_iter()
            .map(|w| w.join().unwrap_or_else(|_| fatal_join("worker")))
            .collect();
        running.store(false, Ordering::Release);
        stop_compiler.store(true, Ordering::Release);

        let compiled =
            compiler.join().unwrap_or_else(|_| fatal_join("compiler"));
        let safepoints =
            safepoints.join().unwrap_or_else(|_| fatal_join("safepoint"));
        (reports, compiled, safepoints)
    });

    let mut total = WorkerReport::default();
    for (i, report) in reports.into_iter().enumerate() {
        match report {
            Ok(r) => {
                total.published += r.published;
                total.discarded += r.discarded;
                total.cached += r.cached;
                total.osr_entries += r.osr_entries;
                total.safepoints += r.safepoints;
            }
            Err(exc) => {
                eprintln!("worker {i} failed: {exc}");
                process::exit(1);
            }
        }
    }

    let stats = vm.signatures().stats();
    println!(
        "== {} threads x {} iterations in {:?} ==",
        cli.threads,
        cli.iterations,
        started.elapsed()
    );
    println!(
        "resolution: {} published, {} discarded, {} cached, {} linker calls",
        total.published,
        total.discarded,
        total.cached,
        linker.calls()
    );
    println!(
        "signature handlers: {} registered, {} generated, {} blobs, {} bytes",
        stats.handlers, stats.generated, stats.blobs, stats.code_bytes
    );
    for (fingerprint, handler) in vm.signatures().handlers() {
        println!("  {:<24} {handler:?}", fingerprint.to_string());
    }
    println!("monitors: {} contended acquisitions", monitors.contended());
    println!(
        "compilation: {} accepted, {} rejected, {} installed, {} OSR entries taken",
        broker.accepted_count(),
        broker.rejected_count(),
        compiled,
        total.osr_entries
    );
    println!(
        "safepoints: {} synchronized, {} thread parks",
        safepoints, total.safepoints
    );
    if let Some(c) = program.worker.counters() {
        println!(
            "worker counters: {} invocations, {} back-edges",
            c.invocations.count(),
            c.backedges.count()
        );
    }
    println!(
        "heap: {} allocations, {} bytes",
        allocator.allocations(),
        allocator.used()
    );
}

fn fatal_join(what: &str) -> ! {
    eprintln!("{what} thread panicked");
    process::exit(2);
}

fn build_program(linker: &StaticLinker) -> Program {
    let mut b = BytecodeBuilder::new();
    b.get_field(0);
    b.invoke(Op::InvokeVirtual, 1);
    b.invoke(Op::InvokeDynamic, 2);
    b.ldc(3);
    b.check_cast(4);
    b.goto_back(0);
    b.new_instance(4);
    b.return_();
    let code = b.into_bytes();
    let sites = vec![0, 3, 6, 9, 12];

    let target = MethodLink {
        target: MethodId(900),
        holder: KlassId(2),
        entry: 0x4000,
        dispatch: Dispatch::VTable(3),
        parameter_size: 2,
    };
    linker.define_field(HOLDER, 11, FieldLink {
        holder: HOLDER,
        offset: 24,
        field_type: BasicType::Int,
        is_volatile: true,
        is_final: false,
        is_static: false,
    });
    linker.define_method(HOLDER, 12, target);
    linker.define_call_site(HOLDER, 13, DynamicLink {
        adapter: MethodLink {
            dispatch: Dispatch::Direct,
            ..target
        },
        appendix: ObjectRef::new(0xA000),
    });
    linker.define_constant(HOLDER, 14, ConstantValue::Long(42));
    linker.define_class(HOLDER, 15, KlassId(3));

    let worker = Method::builder("spin", Signature::new(Vec::new(), BasicType::Void))
        .holder(HOLDER)
        .flags(MethodFlags::STATIC)
        .code(code)
        .max_monitors(1)
        .cp_cache(Arc::new(ConstantPoolCache::new(HOLDER, 11..=15)))
        .build();

    let natives = ["(IJ)V", "(BJ)V", "(Ljava/lang/Object;D)I", "(FFF)F", "(SC)Z"]
        .into_iter()
        .filter_map(Signature::parse)
        .map(|sig| {
            Method::builder("native", sig)
                .holder(HOLDER)
                .flags(MethodFlags::NATIVE | MethodFlags::STATIC)
                .build()
        })
        .collect();

    Program {
        worker,
        natives,
        lock: ObjectRef::new(0xB000),
        sites,
    }
}

fn run_worker(
    vm: &VM,
    program: &Program,
    iterations: usize,
) -> VmResult<WorkerReport> {
    let mut report = WorkerReport::default();
    let mut thread = vm.attach_thread();
    vm.enter_method(&mut thread, program.worker.clone(), None)?;

    for i in 0..iterations {
        for &bci in &program.sites {
            thread.frame_view()?.set_bci(bci);
            match vm.resolve_from_cache(&mut thread)?.outcome {
                Outcome::Published => report.published += 1,
                Outcome::Discarded => report.discarded += 1,
                Outcome::Cached => report.cached += 1,
            }
        }

        thread.frame_view()?.set_bci(3);
        let receiver = KlassId(2 + (i % 3) as u32);
        vm.record_profile(&mut thread, Observation::Receiver(receiver))?;

        vm.monitor_enter(&mut thread, program.lock)?;
        vm.monitor_exit(&mut thread, program.lock)?;

        let native = &program.natives[i % program.natives.len()];
        vm.prepare_native_call(native)?;

        if i % 64 == 0 {
            thread.frame_view()?.set_bci(LOOP_BRANCH_BCI + 3);
            vm.new_instance(&mut thread)?;
        }

        thread.frame_view()?.set_bci(0);
        if vm.backedge(&mut thread, LOOP_BRANCH_BCI)?.is_some() {
            report.osr_entries += 1;
        }
        if vm.at_safepoint(&thread) {
            report.safepoints += 1;
        }
    }

    vm.exit_method(&mut thread)?;
    Ok(report)
}

/// Stand-in compiler: installs placeholder code for every request.
fn run_compiler(broker: &CompileBroker, stop: &AtomicBool) -> usize {
    let mut installed = 0;
    while !stop.load(Ordering::Acquire) {
        let Some(request) = broker.pop() else {
            thread::sleep(Duration::from_micros(200));
            continue;
        };
        let entry = 0x10_0000 + installed * 0x100;
        broker.finish(
            &request,
            Some(CompiledCode::new(entry, request.entry_bci, request.tier)),
        );
        installed += 1;
    }
    installed
}
