use log::*;

use clap::{crate_authors, crate_version, App, AppSettings, Arg, ArgMatches};

use seccomp_sieve::bpf::{self, SeccompData, SECCOMP_RET_TRACE};
use seccomp_sieve::filter::{self, FilterOptions};
use seccomp_sieve::personality::{host_personalities, Personality};
use seccomp_sieve::restart;
use seccomp_sieve::result::Result;
use seccomp_sieve::trace_set::{parse_number_set, TraceSet};

fn personality_arg() -> Arg<'static> {
    Arg::new("personality")
        .short('p')
        .long("personality")
        .takes_value(true)
        .default_value("0")
        .help("Index of the syscall personality in the host table (0 is the native ABI)")
}

fn trace_arg() -> Arg<'static> {
    Arg::new("trace")
        .short('t')
        .long("trace")
        .takes_value(true)
        .multiple_occurrences(true)
        .value_name("SET")
        .help("Syscall numbers to trace, e.g. 0,2,5-7. Applies to --personality.")
}

fn stack_trace_arg() -> Arg<'static> {
    Arg::new("stack-trace")
        .short('k')
        .long("stack-trace")
        .help("Also trace syscalls that change memory mappings")
}

fn parse_personality_arg(args: &ArgMatches) -> (usize, &'static Personality) {
    let table = host_personalities();
    let idx: usize = args.value_of_t_or_exit("personality");
    match table.get(idx) {
        Some(p) => (idx, p),
        None => {
            error!(
                "no personality #{}, this host knows {}",
                idx,
                table
                    .iter()
                    .map(|p| p.name)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            std::process::exit(1);
        }
    }
}

fn trace_set(args: &ArgMatches, idx: usize, p: &Personality) -> Result<TraceSet> {
    let mut set = TraceSet::new(host_personalities(), args.is_present("stack-trace"));
    for spec in args.values_of("trace").into_iter().flatten() {
        for range in parse_number_set(spec, p.nsyscalls)? {
            set.trace_range(idx, range)?;
        }
    }
    Ok(set)
}

fn compile(args: &ArgMatches) -> Result<()> {
    let table = host_personalities();
    let (idx, p) = parse_personality_arg(args);
    let set = trace_set(args, idx, p)?;

    for generator in &filter::generators() {
        let generated = generator.generate(table, &set);
        println!(
            "{}: {} instructions{}",
            generator.name(),
            generated.insns.len(),
            if generated.overflow { " (overflow)" } else { "" }
        );
    }

    match filter::choose(&filter::generators(), table, &set) {
        Ok(filter) => {
            println!("chosen: {}", filter.generator());
            for (i, insn) in filter.instructions().iter().enumerate() {
                println!("{:4}: {}", i, insn);
            }
        }
        Err(reason) => println!("filtering disabled: {}", reason),
    }
    Ok(())
}

fn probe(args: &ArgMatches) -> Result<()> {
    let table = host_personalities();
    let (idx, p) = parse_personality_arg(args);
    let set = trace_set(args, idx, p)?;
    let opts = FilterOptions {
        dump: args.is_present("dump"),
    };

    let setup = filter::setup(table, set, &opts)?;
    println!("filtering: {}", setup.caps.filtering);
    println!(
        "seccomp_before_sysentry: {}",
        setup.caps.seccomp_before_sysentry
    );
    if let Some(reason) = setup.disabled {
        println!("disabled: {}", reason);
    }
    Ok(())
}

fn classify(args: &ArgMatches) -> Result<()> {
    let table = host_personalities();
    let (idx, p) = parse_personality_arg(args);
    let set = trace_set(args, idx, p)?;
    let nr: u32 = args.value_of_t_or_exit("NR");

    let traced = set.is_traced(nr, idx);
    println!(
        "{} syscall {}: predicate {}, restart {:?}",
        p.name,
        nr,
        if traced { "TRACE" } else { "ALLOW" },
        restart::restart_after_exit(&set, nr, idx)
    );

    match filter::choose(&filter::generators(), table, &set) {
        Ok(filter) => {
            let data = SeccompData {
                nr: nr | p.flag,
                arch: p.arch,
            };
            let ret = bpf::run(filter.instructions(), &data)?;
            println!(
                "{} filter: {}",
                filter.generator(),
                if ret == SECCOMP_RET_TRACE {
                    "TRACE"
                } else {
                    "ALLOW"
                }
            );
        }
        Err(reason) => println!("filtering disabled: {}", reason),
    }
    Ok(())
}

fn setup_logging(matches: &clap::ArgMatches) {
    if matches.is_present("verbose") {
        env_logger::Builder::new().parse_filters("debug").init();
        return;
    }

    let loglevel = matches.value_of("loglevel");
    if let Some(level) = loglevel {
        env_logger::Builder::new().parse_filters(level).init();
        return;
    }

    // default
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn main() {
    let compile_command = App::new("compile")
        .about("Compile the traced syscalls into a seccomp filter and print it.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .arg(personality_arg())
        .arg(trace_arg())
        .arg(stack_trace_arg());

    let probe_command = App::new("probe")
        .about("Check seccomp support and the order of seccomp and syscall-entry stops.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .arg(personality_arg())
        .arg(trace_arg())
        .arg(stack_trace_arg())
        .arg(
            Arg::new("dump")
                .short('d')
                .long("dump")
                .help("Log the chosen filter at debug level"),
        );

    let classify_command = App::new("classify")
        .about("Run one syscall number through the chosen filter.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .arg(
            Arg::new("NR")
                .help("Syscall number, without the personality flag")
                .required(true)
                .index(1),
        )
        .arg(personality_arg())
        .arg(trace_arg())
        .arg(stack_trace_arg());

    let main_app = App::new("seccomp-sieve")
        .about("Build seccomp filters that hand selected syscalls to a ptrace tracer.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(Arg::new("verbose")
             .short('v')
             .conflicts_with("loglevel")
             .help("shorthand for --loglevel debug)"))
        .arg(Arg::new("loglevel")
             .short('l')
             .takes_value(true)
             .help("Finegrained verbosity control. See docs.rs/env_logger. Examples: [error, warn, info, debug, trace]"))
        .subcommands([compile_command, probe_command, classify_command]);

    let matches = main_app.get_matches();
    setup_logging(&matches);
    let res = match matches.subcommand() {
        Some(("compile", sub_matches)) => compile(sub_matches),
        Some(("probe", sub_matches)) => probe(sub_matches),
        Some(("classify", sub_matches)) => classify(sub_matches),
        Some((_, _)) => unreachable!(),
        None => unreachable!(),
    };
    if let Err(err) = res {
        error!("{}", err);
        std::process::exit(1);
    }
}
