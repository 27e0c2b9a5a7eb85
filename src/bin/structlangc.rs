//! The structlang compiler binary: reads a source file (or standard
//! input), drives the pipeline front to back, and writes target assembly.
//!
//! The single-letter flags stop the pipeline after a given stage and dump
//! that stage's result, which is how the compiler is debugged.
//!
//! Run with `--help` for more info.

use std::io::{Read, Write};
use std::process::exit;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use structlang::back::emit::select_instructions;
use structlang::back::liveness::{igraph_show, instrs2graph, interference_graph};
use structlang::back::{assem, compile_fragments, Target, TARGET_ARM64, TARGET_X86_64};
use structlang::front::{parse, rewrite_decompose_equal, verify_and_type_program};
use structlang::middle::{
    calculate_frames, canonicalise, translate_program, Fragment, Layouts, TempState,
};

#[derive(Debug, Parser)]
#[command(name = "structlangc", version, about = "structlang compiler")]
struct Args {
    /// the input source file; '-' reads standard input
    input: String,

    /// output filename ('-' = stdout)
    #[arg(short = 'o', value_name = "FILE")]
    output: Option<String>,

    /// the machine to produce assembly for
    #[arg(long = "target", value_enum, default_value_t = TargetOpt::default())]
    target: TargetOpt,

    /// reserved for assembler invocation; currently a no-op
    #[arg(short = 'S')]
    assemble: bool,

    /// parse only (print the AST)
    #[arg(short = 'p')]
    parse_only: bool,

    /// stop after type checking
    #[arg(short = 't')]
    stop_after_type_checking: bool,

    /// stop after AST rewrites and print the AST
    #[arg(short = 'r')]
    stop_after_rewrites: bool,

    /// stop after calculating activation records
    #[arg(short = 'a')]
    stop_after_activation: bool,

    /// stop after translating into the tree IR and print it
    #[arg(short = 'T')]
    stop_after_translation: bool,

    /// stop after canonicalising the tree IR
    #[arg(short = 'C')]
    stop_after_canonicalisation: bool,

    /// stop after instruction selection and print abstract assembly
    #[arg(short = 'i')]
    stop_after_instruction_selection: bool,

    /// stop after liveness analysis and print the interference graph
    #[arg(short = 'l')]
    stop_after_liveness: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum TargetOpt {
    /// arm64 assembly for macOS
    #[value(name = "arm64")]
    Arm64,
    /// x86_64 GAS syntax assembly for Linux
    #[value(name = "x86_64")]
    X86_64,
}

impl Default for TargetOpt {
    fn default() -> Self {
        if cfg!(target_arch = "aarch64") {
            TargetOpt::Arm64
        } else {
            TargetOpt::X86_64
        }
    }
}

impl std::fmt::Display for TargetOpt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetOpt::Arm64 => write!(f, "arm64"),
            TargetOpt::X86_64 => write!(f, "x86_64"),
        }
    }
}

impl TargetOpt {
    fn target(self) -> &'static Target {
        match self {
            TargetOpt::Arm64 => &TARGET_ARM64,
            TargetOpt::X86_64 => &TARGET_X86_64,
        }
    }
}

fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading standard input")?;
        Ok(buf)
    } else {
        std::fs::read_to_string(input).with_context(|| format!("reading {}", input))
    }
}

fn open_output(output: Option<&str>) -> Result<Box<dyn Write>> {
    match output {
        None | Some("-") => Ok(Box::new(std::io::stdout())),
        Some(path) => {
            let file = std::fs::File::create(path).with_context(|| format!("creating {}", path))?;
            Ok(Box::new(file))
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let target = args.target.target();

    let input = read_input(&args.input)?;
    let mut out = open_output(args.output.as_deref())?;
    let filename = if args.input == "-" {
        "<stdin>"
    } else {
        args.input.as_str()
    };

    let mut program = match parse(&input) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("{}: {}", filename, err);
            exit(1);
        }
    };

    if args.parse_only {
        for decl in &program.decls {
            writeln!(out, "{decl}")?;
        }
        return Ok(());
    }

    let errors = verify_and_type_program(filename, &mut program);
    if errors > 0 {
        eprintln!("{} errors", errors);
        exit(1);
    }
    if args.stop_after_type_checking {
        return Ok(());
    }

    // small transformations that make the lowering simpler
    rewrite_decompose_equal(&mut program);
    if args.stop_after_rewrites {
        for decl in &program.decls {
            writeln!(out, "{decl}")?;
        }
        return Ok(());
    }

    let mut layouts = Layouts::new(&program);
    let mut ts = TempState::new();
    let frames = calculate_frames(&mut layouts, target, &mut ts, &program);
    if args.stop_after_activation {
        return Ok(());
    }

    let mut fragments = translate_program(&mut layouts, &mut ts, target, &program, frames);
    if args.stop_after_translation {
        print_fragments(&mut out, &fragments)?;
        return Ok(());
    }

    canonicalise(&mut ts, target, &mut fragments);
    if args.stop_after_canonicalisation {
        print_fragments(&mut out, &fragments)?;
        return Ok(());
    }

    if args.stop_after_instruction_selection {
        let temp_map = target.temp_map();
        for frag in &mut fragments {
            let Fragment::Code { body, frame } = frag else {
                continue;
            };
            writeln!(out, "# {}", frame.name)?;
            for stm in std::mem::take(body) {
                writeln!(out, "## {stm}")?;
                let (instrs, _maps) =
                    select_instructions(&mut ts, target, frame, std::slice::from_ref(&stm));
                for instr in &instrs {
                    write!(out, "{}", assem::format_instr(instr, &temp_map, target))?;
                }
            }
            writeln!(out)?;
        }
        return Ok(());
    }

    if args.stop_after_liveness {
        for frag in &mut fragments {
            let Fragment::Code { body, frame } = frag else {
                continue;
            };
            let body = std::mem::take(body);
            let (mut instrs, _maps) = select_instructions(&mut ts, target, frame, &body);
            target.backend.proc_entry_exit_2(frame, &mut instrs);
            let flow = instrs2graph(&instrs);
            let result = interference_graph(&flow);
            writeln!(out, "# {}", frame.name)?;
            write!(out, "{}", igraph_show(&result.igraph))?;
        }
        return Ok(());
    }

    let asm = compile_fragments(&mut ts, target, fragments, true);
    out.write_all(asm.as_bytes())?;
    Ok(())
}

fn print_fragments(out: &mut dyn Write, fragments: &[Fragment]) -> Result<()> {
    for frag in fragments {
        match frag {
            Fragment::Code { body, frame } => {
                writeln!(out, "# {}", frame.name)?;
                for stm in body {
                    writeln!(out, "{stm}")?;
                }
                writeln!(out)?;
            }
            Fragment::Str { label, value } => {
                writeln!(out, "STRING(LABEL({}), {:?})", label, value)?;
            }
            Fragment::FrameMap { ret_label, .. } => {
                writeln!(out, "FRAMEMAP({})", ret_label)?;
            }
        }
    }
    Ok(())
}
