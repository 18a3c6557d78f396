//! ptrace-driven single-step execution of the traced child.
//!
//! The child is forked with address-space randomization disabled so node
//! addresses stay stable across runs, then stepped one instruction at a
//! time. At every stop the parent reads the instruction pointer, peeks the
//! opcode window out of the child's memory, decodes it, and hands the result
//! to the CFG builder. All the blocking in the system lives here; the graph
//! core never waits.

use std::ffi::CString;
use std::io::Write;
use std::mem::MaybeUninit;
use std::ptr;

use crate::cfg::CfgBuilder;
use crate::decoder::CapstoneDecoder;
use crate::{Address, TraceError, MAX_OPCODE_BYTES};

/// Counters reported after one traced run.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceStats {
    /// Instructions executed and observed, repeats included.
    pub executed: u64,
    /// Stops whose opcode window did not decode and were stepped over.
    pub undecoded: u64,
}

/// Split one input line into the argv of a command to trace.
pub fn split_command(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}

/// Trace `argv` to completion, feeding every executed instruction to
/// `builder` and writing the disassembly listing to `listing`.
pub fn run(
    argv: &[String],
    decoder: &CapstoneDecoder,
    builder: &mut CfgBuilder,
    listing: &mut dyn Write,
) -> Result<TraceStats, TraceError> {
    if argv.is_empty() {
        return Err(TraceError::Trace("empty command".into()));
    }
    let cargv = argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| TraceError::Trace("argument contains a NUL byte".into()))?;

    match unsafe { libc::fork() } {
        -1 => Err(TraceError::Trace(format!(
            "fork failed: {}",
            std::io::Error::last_os_error()
        ))),
        0 => child_exec(&cargv),
        pid => {
            let result = parent_loop(pid, decoder, builder, listing);
            if result.is_err() {
                // Do not leave a stopped child behind on an aborted build.
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                    let mut status = 0;
                    libc::waitpid(pid, &mut status, 0);
                }
            }
            result
        }
    }
}

/// Child side: request tracing and exec the target. Never returns.
fn child_exec(argv: &[CString]) -> ! {
    unsafe {
        // Node identity is the instruction address, so the layout must be
        // the same on every run.
        libc::personality(libc::ADDR_NO_RANDOMIZE as libc::c_ulong);

        if libc::ptrace(
            libc::PTRACE_TRACEME,
            0,
            ptr::null_mut::<libc::c_void>(),
            ptr::null_mut::<libc::c_void>(),
        ) == -1
        {
            libc::_exit(126);
        }

        let mut ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
        ptrs.push(ptr::null());
        libc::execv(argv[0].as_ptr(), ptrs.as_ptr());

        // Only reached when exec itself failed.
        libc::_exit(127);
    }
}

fn parent_loop(
    pid: libc::pid_t,
    decoder: &CapstoneDecoder,
    builder: &mut CfgBuilder,
    listing: &mut dyn Write,
) -> Result<TraceStats, TraceError> {
    let mut stats = TraceStats::default();

    loop {
        let mut status: libc::c_int = 0;
        if unsafe { libc::waitpid(pid, &mut status, 0) } == -1 {
            return Err(TraceError::Trace(format!(
                "waitpid failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
            break;
        }

        let regs = read_registers(pid)?;
        let ip = instruction_pointer(&regs);
        let window = peek_opcode_window(pid, ip);

        if let Some(decoded) = decoder.decode(&window, ip) {
            let bytes = &window[..decoded.size as usize];
            let line = decoded.display_line(ip, bytes);
            writeln!(listing, "{line}")?;
            builder.observe(ip, decoded.size, bytes, &line)?;
            stats.executed += 1;
        } else {
            // Step over bytes capstone rejects; the next stop re-syncs us.
            stats.undecoded += 1;
            log::debug!("undecodable opcode window at 0x{ip:x}");
        }

        single_step(pid)?;
    }

    log::debug!(
        "child exited after {} instructions ({} undecoded stops)",
        stats.executed,
        stats.undecoded
    );
    Ok(stats)
}

fn read_registers(pid: libc::pid_t) -> Result<libc::user_regs_struct, TraceError> {
    let mut regs = MaybeUninit::<libc::user_regs_struct>::uninit();
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGS,
            pid,
            ptr::null_mut::<libc::c_void>(),
            regs.as_mut_ptr(),
        )
    };
    if rc == -1 {
        return Err(TraceError::Trace(format!(
            "PTRACE_GETREGS failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(unsafe { regs.assume_init() })
}

#[cfg(target_arch = "x86_64")]
fn instruction_pointer(regs: &libc::user_regs_struct) -> Address {
    regs.rip
}

#[cfg(target_arch = "x86")]
fn instruction_pointer(regs: &libc::user_regs_struct) -> Address {
    regs.eip as Address
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
compile_error!("the tracer only supports x86-64 and x86 hosts");

/// Peek the opcode window at `ip` in word-sized reads. Failed reads near an
/// unmapped page edge leave zero bytes; the decoder sorts it out.
fn peek_opcode_window(pid: libc::pid_t, ip: Address) -> [u8; MAX_OPCODE_BYTES] {
    const WORD: usize = std::mem::size_of::<libc::c_long>();
    let mut window = [0u8; MAX_OPCODE_BYTES];
    for offset in (0..MAX_OPCODE_BYTES).step_by(WORD) {
        let word = unsafe {
            libc::ptrace(
                libc::PTRACE_PEEKDATA,
                pid,
                (ip + offset as Address) as *mut libc::c_void,
                ptr::null_mut::<libc::c_void>(),
            )
        };
        window[offset..offset + WORD].copy_from_slice(&word.to_ne_bytes());
    }
    window
}

/// Request one more instruction. ptrace occasionally reports -1 while the
/// stop is still settling; retry until it takes, bailing out only when the
/// child is gone.
fn single_step(pid: libc::pid_t) -> Result<(), TraceError> {
    loop {
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_SINGLESTEP,
                pid,
                ptr::null_mut::<libc::c_void>(),
                ptr::null_mut::<libc::c_void>(),
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Err(TraceError::Trace(format!("PTRACE_SINGLESTEP failed: {err}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command() {
        assert_eq!(
            split_command("/bin/echo hello world"),
            vec!["/bin/echo", "hello", "world"]
        );
        assert_eq!(split_command("  /bin/true  "), vec!["/bin/true"]);
        assert!(split_command("\n").is_empty());
    }

    #[test]
    fn test_empty_command_is_an_error() {
        let decoder = crate::decoder::CapstoneDecoder::for_architecture(
            crate::Architecture::X86_64,
            crate::decoder::Syntax::Att,
        )
        .unwrap();
        let mut builder = CfgBuilder::new();
        let err = run(&[], &decoder, &mut builder, &mut std::io::sink()).unwrap_err();
        assert!(matches!(err, TraceError::Trace(_)));
    }
}
