//! Builder for a thread's initial stack image.
//!
//! The image follows the System-V entry convention as the seL4 runtime
//! expects it, read from the stack pointer upward: argc, the argv pointers
//! with their null terminator, the envp pointers with theirs, the auxiliary
//! vector closed by an `AT_NULL` entry, padding to a 16-byte boundary, and
//! finally the string blobs themselves at the top of the stack.
//!
//! Strings are laid out from the stack top downward in the order they are
//! added, so the first string added sits at the highest address. Word and
//! int widths, endianness, and the auxv layout all come from the seL4 info
//! record rather than from the host.

use crate::sel4::SeL4Info;

const STACK_ALIGNMENT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxvEntry {
    pub a_type: u64,
    pub a_val: u64,
}

struct PlacedString {
    /// String bytes including the terminating NUL.
    bytes: Vec<u8>,
    addr: u64,
}

/// The finished image and the register values derived from it.
#[derive(Debug)]
pub struct StackImage {
    /// Stack bytes from the lowest address (the initial stack pointer)
    /// upward to the stack top.
    pub bytes: Vec<u8>,
    pub stack_pointer_addr: u64,
    /// argc, argv, envp as the first three entry arguments.
    pub arg0: u64,
    pub arg1: u64,
    pub arg2: u64,
}

pub struct StackBuilder<'a> {
    info: &'a SeL4Info,
    stack_top_addr: u64,
    /// Cursor for string placement; decremented before each string.
    custom_data_start: u64,
    args: Vec<PlacedString>,
    envs: Vec<PlacedString>,
    auxv: Vec<AuxvEntry>,
}

impl<'a> StackBuilder<'a> {
    pub fn new(info: &'a SeL4Info, stack_top_addr: u64) -> StackBuilder<'a> {
        StackBuilder {
            info,
            stack_top_addr,
            custom_data_start: stack_top_addr,
            args: Vec::new(),
            envs: Vec::new(),
            auxv: Vec::new(),
        }
    }

    pub fn push_arg(&mut self, arg: &str) {
        let placed = self.place_string(arg);
        self.args.push(placed);
    }

    pub fn push_env(&mut self, env: &str) {
        let placed = self.place_string(env);
        self.envs.push(placed);
    }

    pub fn push_auxv(&mut self, a_type: u64, a_val: u64) {
        self.auxv.push(AuxvEntry { a_type, a_val });
    }

    fn place_string(&mut self, s: &str) -> PlacedString {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.custom_data_start -= bytes.len() as u64;
        PlacedString {
            bytes,
            addr: self.custom_data_start,
        }
    }

    /// Each auxv entry is an int-sized `a_type`, compiler padding up to the
    /// offset of the `a_un` union, then a word-sized value.
    fn write_auxv(&self, data: &mut Vec<u8>, entry: AuxvEntry) {
        data.extend_from_slice(&self.info.encode_int(entry.a_type));
        let padding =
            usize::from(self.info.literals.auxv_un_offset) - usize::from(self.info.literals.int_bytes);
        data.resize(data.len() + padding, 0);
        data.extend_from_slice(&self.info.encode_word(entry.a_val));
    }

    pub fn finish(self) -> StackImage {
        let info = self.info;
        let word_len = info.word_len() as u64;
        let mut data: Vec<u8> = Vec::new();

        // argc
        data.extend_from_slice(&info.encode_word(self.args.len() as u64));

        // argv pointers, null-terminated
        for arg in &self.args {
            data.extend_from_slice(&info.encode_word(arg.addr));
        }
        data.extend_from_slice(&info.encode_word(0));

        // envp pointers, null-terminated
        for env in &self.envs {
            data.extend_from_slice(&info.encode_word(env.addr));
        }
        data.extend_from_slice(&info.encode_word(0));

        // auxiliary vector, closed by the AT_NULL entry
        for entry in &self.auxv {
            self.write_auxv(&mut data, *entry);
        }
        self.write_auxv(
            &mut data,
            AuxvEntry {
                a_type: info.literals.at_null,
                a_val: 0,
            },
        );

        // String blobs run from the cursor up to the stack top; appending
        // them in reverse-added order produces exactly that memory image.
        let mut blob: Vec<u8> = Vec::new();
        for placed in self.args.iter().chain(self.envs.iter()).rev() {
            blob.extend_from_slice(&placed.bytes);
        }

        let padding = (data.len() + blob.len()).wrapping_neg() % STACK_ALIGNMENT;
        data.resize(data.len() + padding, 0);
        data.extend_from_slice(&blob);

        let stack_pointer_addr = self.stack_top_addr - data.len() as u64;
        let arg0 = self.args.len() as u64;
        let arg1 = stack_pointer_addr + word_len;
        let arg2 = arg1 + word_len * (arg0 + 1);

        StackImage {
            bytes: data,
            stack_pointer_addr,
            arg0,
            arg1,
            arg2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_info;

    /// Pull the image apart again the way the runtime would read it.
    struct ParsedStack {
        argc: u64,
        argv: Vec<String>,
        envp: Vec<String>,
        auxv: Vec<AuxvEntry>,
    }

    fn parse(info: &SeL4Info, image: &StackImage, stack_top: u64) -> ParsedStack {
        let word = info.word_len();
        let base = image.stack_pointer_addr;
        let read_word = |offset: usize| -> u64 {
            let bytes = &image.bytes[offset..offset + word];
            let mut buf = [0u8; 8];
            buf[..word].copy_from_slice(bytes);
            u64::from_le_bytes(buf)
        };
        let read_string = |addr: u64| -> String {
            let offset = (addr - base) as usize;
            let end = image.bytes[offset..].iter().position(|b| *b == 0).unwrap() + offset;
            String::from_utf8(image.bytes[offset..end].to_vec()).unwrap()
        };

        let mut offset = 0;
        let argc = read_word(offset);
        offset += word;
        let mut argv = Vec::new();
        loop {
            let ptr = read_word(offset);
            offset += word;
            if ptr == 0 {
                break;
            }
            argv.push(read_string(ptr));
        }
        let mut envp = Vec::new();
        loop {
            let ptr = read_word(offset);
            offset += word;
            if ptr == 0 {
                break;
            }
            envp.push(read_string(ptr));
        }
        let mut auxv = Vec::new();
        loop {
            let int_len = usize::from(info.literals.int_bytes);
            let mut buf = [0u8; 8];
            buf[..int_len].copy_from_slice(&image.bytes[offset..offset + int_len]);
            let a_type = u64::from_le_bytes(buf);
            offset += usize::from(info.literals.auxv_un_offset);
            let a_val = read_word(offset);
            offset += word;
            auxv.push(AuxvEntry { a_type, a_val });
            if a_type == info.literals.at_null {
                break;
            }
        }
        assert_eq!(base + image.bytes.len() as u64, stack_top);
        ParsedStack {
            argc,
            argv,
            envp,
            auxv,
        }
    }

    #[test]
    fn round_trips_args_envs_and_auxv() {
        let info = test_info();
        let top = 0x405000u64;
        let mut builder = StackBuilder::new(&info, top);
        builder.push_arg("worker");
        builder.push_arg("--fast");
        builder.push_env("ipc_buffer=4218880");
        builder.push_auxv(info.literals.at_sel4_ipc_buffer_ptr, 0x406000);
        builder.push_auxv(info.literals.at_sysinfo, 0x500000);
        let image = builder.finish();

        let parsed = parse(&info, &image, top);
        assert_eq!(parsed.argc, 2);
        assert_eq!(parsed.argv, vec!["worker", "--fast"]);
        assert_eq!(parsed.envp, vec!["ipc_buffer=4218880"]);
        assert_eq!(
            parsed.auxv,
            vec![
                AuxvEntry {
                    a_type: info.literals.at_sel4_ipc_buffer_ptr,
                    a_val: 0x406000
                },
                AuxvEntry {
                    a_type: info.literals.at_sysinfo,
                    a_val: 0x500000
                },
                AuxvEntry { a_type: 0, a_val: 0 },
            ]
        );

        // The fixed part of the image ends 16-byte aligned.
        let blob_len: usize = ["worker", "--fast", "ipc_buffer=4218880"]
            .iter()
            .map(|s| s.len() + 1)
            .sum();
        assert_eq!((image.bytes.len() - blob_len) % STACK_ALIGNMENT, 0);

        // The first string added sits at the highest address.
        let first_arg_addr = top - ("worker".len() as u64 + 1);
        assert_eq!(
            &image.bytes[(first_arg_addr - image.stack_pointer_addr) as usize..],
            &b"worker\0"[..]
        );
    }

    #[test]
    fn entry_args_point_at_argv_and_envp() {
        let info = test_info();
        let mut builder = StackBuilder::new(&info, 0x800000);
        builder.push_arg("main");
        builder.push_env("a=1");
        builder.push_env("b=2");
        let image = builder.finish();

        let word = info.word_len() as u64;
        assert_eq!(image.arg0, 1);
        assert_eq!(image.arg1, image.stack_pointer_addr + word);
        // envp starts after argc, one argv pointer, and the argv terminator.
        assert_eq!(image.arg2, image.arg1 + word * 2);
        assert_eq!(image.stack_pointer_addr % 16, 0);
    }

    #[test]
    fn empty_stack_still_carries_the_terminators() {
        let info = test_info();
        let image = StackBuilder::new(&info, 0x800000).finish();
        // argc + argv null + envp null + one auxv entry, padded to 16.
        let word = info.word_len();
        let auxv_len = usize::from(info.literals.auxv_un_offset) + word;
        let fixed = 3 * word + auxv_len;
        assert_eq!(image.bytes.len(), fixed + (fixed.wrapping_neg() % 16));
        assert_eq!(image.arg0, 0);
    }
}
