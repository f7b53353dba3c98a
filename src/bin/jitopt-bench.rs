// Copyright (c) 2017-2020 Fabian Schuiki

#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;

use anyhow::{anyhow, bail, Context, Result};
use clap::Arg;
use itertools::Itertools;
use jitopt::{
    analysis::DOMINATOR_TREE_TIME,
    ir::prelude::*,
    opt::{default_stages, optimize_module, prelude::*, run_stages, Stage, STAGES},
    ssa::{compute_ssa, SSA_TIME},
    verifier::Verifier,
    OptimizerConfig,
};
use rayon::prelude::*;
use std::sync::{atomic::Ordering, Arc};

fn main() {
    match main_inner() {
        Ok(_) => (),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn main_inner() -> Result<()> {
    let matches = app_from_crate!()
        .about("Builds a batch of sample methods and runs the optimizer over them.")
        .arg(
            Arg::with_name("verbosity")
                .short("v")
                .multiple(true)
                .help(HELP_VERBOSITY.lines().next().unwrap_or_default())
                .long_help(HELP_VERBOSITY),
        )
        .arg(
            Arg::with_name("copies")
                .short("n")
                .long("copies")
                .takes_value(true)
                .default_value("1")
                .help("Number of copies of each sample method to optimize"),
        )
        .arg(
            Arg::with_name("dump")
                .short("d")
                .long("dump")
                .help("Print the optimized methods"),
        )
        .arg(
            Arg::with_name("verify")
                .long("verify")
                .help("Verify the graphs between stages, even in release builds"),
        )
        .arg(
            Arg::with_name("time-passes")
                .short("t")
                .long("time")
                .help("Print execution time statistics per stage"),
        )
        .arg(
            Arg::with_name("single-threaded")
                .short("s")
                .long("no-parallel")
                .help("Do not parallelize execution"),
        )
        .arg(
            Arg::with_name("disable")
                .short("D")
                .long("disable")
                .value_name("FEATURE")
                .takes_value(true)
                .multiple(true)
                .help(HELP_DISABLE.lines().next().unwrap_or_default())
                .long_help(HELP_DISABLE),
        )
        .arg(
            Arg::with_name("passes")
                .short("p")
                .long("pass")
                .value_name("PASS")
                .takes_value(true)
                .multiple(true)
                .help(HELP_PASSES.lines().next().unwrap_or_default())
                .long_help(HELP_PASSES),
        )
        .get_matches();

    // Configure the logger.
    let verbose = std::cmp::max(1, matches.occurrences_of("verbosity") as usize) - 1;
    let quiet = !matches.is_present("verbosity");
    stderrlog::new()
        .module("jitopt")
        .module("jitopt_bench")
        .quiet(quiet)
        .verbosity(verbose)
        .init()
        .map_err(|e| anyhow!("cannot set up logging: {}", e))?;

    // Configure rayon to be single-threaded if requested.
    if matches.is_present("single-threaded") {
        info!("Limiting to one rayon worker thread");
        rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build_global()?;
    }

    let mut config = OptimizerConfig::default();
    config.verify = matches.is_present("verify");
    for feature in matches.values_of("disable").into_iter().flatten() {
        match feature {
            "cha" => config.use_cha = false,
            "types" => config.propagate_types = false,
            "sccp" => config.constant_propagation = false,
            "loadcse" => config.load_cse = false,
            "cse" => config.cse = false,
            "licm" => config.licm = false,
            "range" => config.range_analysis = false,
            "bce" => config.array_bounds_check_elimination = false,
            "mints" => config.unboxed_mints = false,
            _ => bail!("unknown feature `{}`", feature),
        }
    }
    let copies: usize = matches
        .value_of("copies")
        .unwrap_or("1")
        .parse()
        .context("invalid number of copies")?;

    // Prepare the time tracking.
    let mut times = vec![];
    let tinit = time::precise_time_ns();

    // Build the sample methods.
    let t0 = time::precise_time_ns();
    let classes = Arc::new(sample_classes());
    let mut module = Module::new(classes.clone());
    for copy in 0..copies {
        for build in SAMPLES.iter() {
            let mut graph = build(&classes)?;
            graph.name = format!("{}#{}", graph.name, copy);
            module.add_graph(graph);
        }
    }
    let t1 = time::precise_time_ns();
    times.push(("build".to_owned(), t1 - t0));

    let ctx = PassContext::new(config, classes);

    // Determine the stages to be run and apply them.
    let t0 = time::precise_time_ns();
    let results = if let Some(passes) = matches.values_of("passes") {
        let stages = passes
            .map(|name| Stage::from_name(name).ok_or_else(|| anyhow!("unknown pass `{}`", name)))
            .collect::<Result<Vec<_>>>()?;
        debug!("Running {}", stages.iter().map(|s| s.name()).format(", "));
        module
            .par_graphs_mut()
            .map(|graph| compute_ssa(graph).and_then(|_| run_stages(&ctx, graph, &stages)))
            .collect()
    } else {
        debug!(
            "Running {}",
            default_stages(&ctx).iter().map(|s| s.name()).format(", ")
        );
        optimize_module(&ctx, &mut module)
    };
    let t1 = time::precise_time_ns();
    times.push(("optimize".to_owned(), t1 - t0));
    let failures = results.iter().filter(|result| result.is_err()).count();
    if failures > 0 {
        warn!("{} of {} methods bailed out", failures, module.len());
    }

    // Verify the methods that were optimized successfully.
    let t0 = time::precise_time_ns();
    let mut verifier = Verifier::new();
    for (graph, result) in module.graphs().zip(&results) {
        if result.is_ok() {
            verifier.verify_graph(graph);
        }
    }
    verifier
        .finish()
        .map_err(|errs| anyhow!("Verification failed after optimization:\n{}", errs))?;
    let t1 = time::precise_time_ns();
    times.push(("verify".to_owned(), t1 - t0));

    if matches.is_present("dump") {
        print!("{}", module.dump());
    }

    // Final time stat.
    let tfinal = time::precise_time_ns();
    times.push(("total".to_owned(), tfinal - tinit));

    // Print execution time statistics if requested by the user.
    if matches.is_present("time-passes") {
        eprintln!("Execution Time Statistics:");
        for (mut name, ns) in times {
            name.push(':');
            eprintln!("  {:10}  {:8.3} ms", name, ns as f64 * 1.0e-6);
        }
        eprintln!("");
        eprintln!("Stage Statistics:");
        for &stage in STAGES.iter() {
            eprintln!(
                "  {:11} {:8.3} ms",
                format!("{}:", stage.name()),
                stage.time() as f64 * 1.0e-6
            );
        }
        eprintln!("");
        eprintln!("Structure Statistics:");
        eprintln!(
            "  SSA Construction:            {:8.3} ms",
            SSA_TIME.load(Ordering::SeqCst) as f64 * 1.0e-6
        );
        eprintln!(
            "  Dominator Tree Construction: {:8.3} ms",
            DOMINATOR_TREE_TIME.load(Ordering::SeqCst) as f64 * 1.0e-6
        );
    }

    // Dump some threading statistics.
    info!("Used {} rayon worker threads", rayon::current_num_threads());

    Ok(())
}

/// The class hierarchy of the sample methods: the core library plus a point
/// class with two double fields and a box class with two mutable fields.
fn sample_classes() -> ClassTable {
    let mut classes = ClassTable::new();
    let point = classes.add_class("Point", None);
    classes.add_field(point, "x", true, ClassId::DOUBLE);
    classes.add_field(point, "y", true, ClassId::DOUBLE);
    let pair = classes.add_class("Pair", None);
    classes.add_field(pair, "first", false, ClassId::DYNAMIC);
    classes.add_field(pair, "second", false, ClassId::DYNAMIC);
    classes
}

static SAMPLES: [fn(&ClassTable) -> Result<FlowGraph>; 4] =
    [sum_list, squared_norm, select_constant, forward_store];

/// Feedback recording a single observation of the given argument classes.
fn feedback(classes: &ClassTable, name: &str, cids: &[ClassId]) -> Result<IcData> {
    let target = classes
        .resolve_dynamic(cids[0], name)
        .ok_or_else(|| anyhow!("no method `{}` on {}", name, cids[0]))?;
    let mut ic = IcData::new(name, cids.len());
    ic.add_check(cids.to_vec(), target);
    Ok(ic)
}

fn class_named(classes: &ClassTable, name: &str) -> Result<ClassId> {
    classes
        .class_by_name(name)
        .ok_or_else(|| anyhow!("no class `{}`", name))
}

/// `s = 0; for (i = 0; i < a.length; i++) s += a[i]; return s;`
fn sum_list(classes: &ClassTable) -> Result<FlowGraph> {
    let smis = [ClassId::SMI, ClassId::SMI];
    let mut graph = FlowGraph::new("sum_list", 1, 2);
    let mut b = GraphBuilder::new(&mut graph);
    let header = b.join_block();
    let body = b.target_block();
    let exit = b.target_block();

    let zero = b.smi(0);
    b.store_local(1, zero);
    let zero = b.smi(0);
    b.store_local(2, zero);
    b.goto(header);

    b.append_to(header);
    let i = b.load_local(2);
    let a = b.load_local(0);
    let ic = feedback(classes, "get:length", &[ClassId::ARRAY])?;
    let length = b.getter_call("length", a, Some(ic));
    let ic = feedback(classes, "<", &smis)?;
    b.branch(
        Comparison::relational(Token::Lt, i, length, Some(Arc::new(ic))),
        body,
        exit,
    );

    b.append_to(body);
    let s = b.load_local(1);
    let a = b.load_local(0);
    let i = b.load_local(2);
    let ic = feedback(classes, "[]", &[ClassId::ARRAY, ClassId::SMI])?;
    let element = b.instance_call("[]", Token::Index, &[a, i], 2, Some(ic));
    let sum = b.binary_call(Token::Add, s, element, Some(feedback(classes, "+", &smis)?));
    b.store_local(1, sum);
    let i = b.load_local(2);
    let one = b.smi(1);
    let next = b.binary_call(Token::Add, i, one, Some(feedback(classes, "+", &smis)?));
    b.store_local(2, next);
    b.goto(header);

    b.append_to(exit);
    let s = b.load_local(1);
    b.return_value(s);
    Ok(graph)
}

/// `return p.x * p.x + p.y * p.y;`
fn squared_norm(classes: &ClassTable) -> Result<FlowGraph> {
    let point = class_named(classes, "Point")?;
    let doubles = [ClassId::DOUBLE, ClassId::DOUBLE];
    let mut graph = FlowGraph::new("squared_norm", 1, 0);
    let mut b = GraphBuilder::new(&mut graph);
    let mut squares = vec![];
    for &field in &["x", "y"] {
        let getter = format!("get:{}", field);
        let p = b.load_local(0);
        let left = b.getter_call(field, p, Some(feedback(classes, &getter, &[point])?));
        let p = b.load_local(0);
        let right = b.getter_call(field, p, Some(feedback(classes, &getter, &[point])?));
        let ic = feedback(classes, "*", &doubles)?;
        squares.push(b.binary_call(Token::Mul, left, right, Some(ic)));
    }
    let ic = feedback(classes, "+", &doubles)?;
    let sum = b.binary_call(Token::Add, squares[0], squares[1], Some(ic));
    b.return_value(sum);
    Ok(graph)
}

/// `x = 3; if (x === 3) r = k + 1; else r = k - 1; return r;`
fn select_constant(classes: &ClassTable) -> Result<FlowGraph> {
    let smis = [ClassId::SMI, ClassId::SMI];
    let mut graph = FlowGraph::new("select_constant", 1, 2);
    let mut b = GraphBuilder::new(&mut graph);
    let then_bb = b.target_block();
    let else_bb = b.target_block();
    let join = b.join_block();

    let three = b.smi(3);
    b.store_local(1, three);
    let x = b.load_local(1);
    let three = b.smi(3);
    b.branch(Comparison::strict(Token::EqStrict, x, three), then_bb, else_bb);
    for &(bb, op) in &[(then_bb, Token::Add), (else_bb, Token::Sub)] {
        b.append_to(bb);
        let k = b.load_local(0);
        let one = b.smi(1);
        let ic = feedback(classes, op.symbol(), &smis)?;
        let r = b.binary_call(op, k, one, Some(ic));
        b.store_local(2, r);
        b.goto(join);
    }

    b.append_to(join);
    let r = b.load_local(2);
    b.return_value(r);
    Ok(graph)
}

/// `o.first = v; o.second = 1; return o.first;`
fn forward_store(classes: &ClassTable) -> Result<FlowGraph> {
    let pair = class_named(classes, "Pair")?;
    let field = |name: &str| {
        classes
            .lookup_field(pair, name)
            .map(|f| f.offset)
            .ok_or_else(|| anyhow!("no field `{}`", name))
    };
    let (first, second) = (field("first")?, field("second")?);
    let mut graph = FlowGraph::new("forward_store", 2, 0);
    let mut b = GraphBuilder::new(&mut graph);
    let o = b.load_local(0);
    let v = b.load_local(1);
    b.store_field(o, first, v);
    let o = b.load_local(0);
    let one = b.smi(1);
    b.store_field(o, second, one);
    let o = b.load_local(0);
    let value = b.load_field(o, first, false);
    b.return_value(value);
    Ok(graph)
}

static HELP_VERBOSITY: &str = "Increase message verbosity

This option can be specified multiple times to increase the level of verbosity \
in the output:

-v      Only print errors
-vv     Also print warnings
-vvv    Also print info messages
-vvvv   Also print debug messages
-vvvvv  Also print detailed tracing messages
";

static HELP_DISABLE: &str = "Disable an optimization feature

This option can be specified multiple times. The features are as follows:

cha         Class hierarchy analysis for receiver checks
types       Type propagation
sccp        Sparse conditional constant propagation
loadcse     Load elimination and store forwarding
cse         Dominator-based common subexpression elimination
licm        Loop-invariant code motion
range       Range analysis
bce         Bounds check elimination
mints       Unboxed 64 bit integer arithmetic
";

static HELP_PASSES: &str = "Exact order of passes to run

This option specifies the exact order of passes to be executed after SSA \
construction. The admissible passes are as follows:

specialize  Call specialization from type feedback
classids    Specialization from propagated class ids
canon       Canonicalization
types       Type propagation
sccp        Sparse conditional constant propagation
loadelim    Load elimination and store forwarding
cse         Dominator-based common subexpression elimination
licm        Loop-invariant code motion
smi         Small integer propagation
range       Range analysis and bounds check elimination
repr        Representation selection
";
