//! Quill compiler CLI (§6): read a lexer output buffer, compile it to
//! P-code, and either write the serialized program or dump its
//! disassembly.

use clap::{ArgAction, CommandFactory, Parser as ClapParser};
use clap_complete::{generate, Shell};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process;

use quillc::CompileError;

#[derive(ClapParser)]
#[command(name = "quillc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Quill compiler - compile lexed Quill source to P-code", long_about = None)]
#[command(disable_help_flag = true)]
struct Cli {
    /// Input file, or '-' to read from standard input. Not required when
    /// generating shell completions.
    input: Option<PathBuf>,

    /// Output file (defaults to standard output)
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    output: Option<PathBuf>,

    /// Dump disassembly instead of writing a serialized program
    #[arg(short = 'S')]
    disassemble: bool,

    /// Print shell completion script for the named shell and exit
    #[arg(long = "completions", value_name = "SHELL")]
    completions: Option<Shell>,

    /// Print help
    #[arg(short = '?', long = "help", action = ArgAction::Help)]
    help: Option<bool>,
}

/// Magic bytes stamped at the head of a serialized program file (§6: "a
/// header of magic bytes, version, and counters"). Not part of the
/// core's in-memory `Program` contract — only the CLI's on-disk framing.
const FILE_MAGIC: &[u8; 4] = b"QLPC";

fn serialize_program_file(program: &quillc_core::Program) -> Vec<u8> {
    use quillc_core::codec::encode_vlq_size;

    let mut out = Vec::with_capacity(FILE_MAGIC.len() + 1 + program.code.len() + program.data.len() + 8);
    out.extend_from_slice(FILE_MAGIC);
    out.push(quillc_core::Program::VERSION);
    encode_vlq_size(program.code.len() as u64, &mut out);
    out.extend_from_slice(&program.code);
    encode_vlq_size(program.data.len() as u64, &mut out);
    out.extend_from_slice(&program.data);
    out
}

fn read_input(path: &PathBuf) -> io::Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        let mut buf = Vec::new();
        io::stdin().read_to_end(&mut buf)?;
        Ok(buf)
    } else {
        std::fs::read(path)
    }
}

fn write_output(output: &Option<PathBuf>, bytes: &[u8]) -> io::Result<()> {
    match output {
        Some(path) => std::fs::write(path, bytes),
        None => io::stdout().write_all(bytes),
    }
}

fn main() {
    let cli = Cli::parse();

    if let Some(shell) = cli.completions {
        generate(shell, &mut Cli::command(), "quillc", &mut io::stdout());
        return;
    }

    let Some(input) = cli.input else {
        eprintln!("Error: missing input file (use '-' for standard input)");
        process::exit(2);
    };

    let input_bytes = match read_input(&input) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Error reading {}: {}", input.display(), e);
            process::exit(2);
        }
    };

    let lex = match quillc::lexfmt::decode(&input_bytes) {
        Ok(lex) => lex,
        Err(e) => {
            eprintln!("Error: malformed lexer output: {e}");
            process::exit(2);
        }
    };

    let program = match quillc::compile(&lex) {
        Ok(p) => p,
        Err(e) => {
            report_compile_error(&e);
            process::exit(1);
        }
    };

    let result = if cli.disassemble {
        let mut buf = Vec::new();
        quillc::disasm::disassemble(&program, &mut buf).and_then(|_| write_output(&cli.output, &buf))
    } else {
        write_output(&cli.output, &serialize_program_file(&program))
    };

    if let Err(e) = result {
        eprintln!("Error writing output: {e}");
        process::exit(2);
    }
}

fn report_compile_error(e: &CompileError) {
    eprintln!("Error: {e}");
}
