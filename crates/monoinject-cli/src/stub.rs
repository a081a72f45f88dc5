//! Call frame layout and the machine code that runs inside it.
//!
//! A frame is one RWX allocation in the target:
//!
//! ```text
//! 0x000  call stub
//! 0x100  return value (8 bytes)
//! 0x108  completion flag (4 bytes)
//! 0x110  out parameter slots (4 bytes each)
//! 0x200  string data
//! ```
//!
//! The stub is entered by redirecting a suspended thread to it with the
//! thread's original instruction pointer pushed as the return address. It
//! saves the volatile registers and the floating point state, calls the
//! target, stores the result, raises the completion flag and returns to where
//! the thread was.

use monoinject_shared::{Error, RemoteArg, Result};

pub const RESULT_OFFSET: u64 = 0x100;
pub const DONE_OFFSET: u64 = 0x108;
pub const OUT_SLOTS_OFFSET: u64 = 0x110;
pub const DATA_OFFSET: u64 = 0x200;
pub const FRAME_SIZE: usize = 0x4000;

/// Register-passed arguments on x64; also the widest Mono signature we call.
pub const MAX_ARGS: usize = 4;

const MAX_OUT_SLOTS: usize = ((DATA_OFFSET - OUT_SLOTS_OFFSET) / 4) as usize;

/// Arguments laid out in a frame.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Marshalled {
    /// Value passed for each argument.
    pub values: Vec<u64>,
    /// Bytes to copy into the frame before the call.
    pub writes: Vec<(u64, Vec<u8>)>,
    /// `(argument index, slot address)` of every out parameter.
    pub out_slots: Vec<(usize, u64)>,
}

/// Place `args` in the frame at `frame`.
pub fn marshal(frame: u64, args: &[RemoteArg]) -> Result<Marshalled> {
    if args.len() > MAX_ARGS {
        return Err(Error::Marshal(format!(
            "{} arguments exceed the {} supported by the call stub",
            args.len(),
            MAX_ARGS
        )));
    }

    let mut marshalled = Marshalled::default();
    let mut data = DATA_OFFSET;

    for (index, arg) in args.iter().enumerate() {
        let value = match arg {
            RemoteArg::Pointer(address) => address.0,
            RemoteArg::Int32(value) => *value as u32 as u64,
            RemoteArg::CStr(value) => {
                let bytes = value.as_bytes_with_nul();
                let end = data + bytes.len() as u64;
                if end > FRAME_SIZE as u64 {
                    return Err(Error::Marshal(
                        "string arguments do not fit in the call frame".into(),
                    ));
                }
                let address = frame + data;
                marshalled.writes.push((address, bytes.to_vec()));
                data = (end + 7) & !7;
                address
            }
            RemoteArg::OutInt32(initial) => {
                let slot = marshalled.out_slots.len();
                if slot >= MAX_OUT_SLOTS {
                    return Err(Error::Marshal("too many out parameters".into()));
                }
                let address = frame + OUT_SLOTS_OFFSET + slot as u64 * 4;
                marshalled
                    .writes
                    .push((address, initial.to_le_bytes().to_vec()));
                marshalled.out_slots.push((index, address));
                address
            }
        };
        marshalled.values.push(value);
    }

    Ok(marshalled)
}

/// How a stub preserves the interrupted thread's x87, SSE and AVX state.
///
/// The callee may clobber any of it, and the thread may have been stopped in
/// the middle of floating point code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSave {
    /// `fxsave`/`fxrstor`: x87, MMX and XMM registers.
    Fx,
    /// `xsave`/`xrstor` with the x87, SSE, AVX and AVX-512 components.
    X,
}

/// x87 | SSE | AVX | opmask | ZMM_Hi256 | Hi16_ZMM
const XSAVE_MASK: u32 = 0xE7;
const XSAVE_HEADER: u32 = 512;

impl StateSave {
    /// Stack bytes reserved for the save area, a multiple of its 64-byte alignment.
    pub fn area_size(self) -> u32 {
        match self {
            StateSave::Fx => 512,
            // legacy region, header and the components in `XSAVE_MASK`
            StateSave::X => 0xB00,
        }
    }

    /// Save into the area at the stack pointer. `wide` selects the 64-bit forms.
    fn emit_save(self, code: &mut Vec<u8>, wide: bool) {
        match self {
            StateSave::Fx => emit_state_op(code, wide, 0x04),
            StateSave::X => {
                // a standard-form xrstor faults on a dirty header
                code.extend_from_slice(&[0x31, 0xC0]);
                let stride = if wide { 8 } else { 4 };
                for offset in (XSAVE_HEADER..XSAVE_HEADER + 64).step_by(stride) {
                    if wide {
                        code.push(0x48);
                    }
                    code.extend_from_slice(&[0x89, 0x84, 0x24]);
                    code.extend_from_slice(&offset.to_le_bytes());
                }
                emit_xsave_mask(code);
                emit_state_op(code, wide, 0x24);
            }
        }
    }

    fn emit_restore(self, code: &mut Vec<u8>, wide: bool) {
        match self {
            StateSave::Fx => emit_state_op(code, wide, 0x0C),
            StateSave::X => {
                emit_xsave_mask(code);
                emit_state_op(code, wide, 0x2C);
            }
        }
    }
}

/// `0F AE /n [esp]`, with REX.W when `wide`.
fn emit_state_op(code: &mut Vec<u8>, wide: bool, modrm: u8) {
    if wide {
        code.push(0x48);
    }
    code.extend_from_slice(&[0x0F, 0xAE, modrm, 0x24]);
}

/// mov eax, XSAVE_MASK; xor edx, edx
fn emit_xsave_mask(code: &mut Vec<u8>) {
    code.push(0xB8);
    code.extend_from_slice(&XSAVE_MASK.to_le_bytes());
    code.extend_from_slice(&[0x31, 0xD2]);
}

/// x64 stub calling `target(args...)` with the Microsoft x64 convention.
pub fn x64(frame: u64, target: u64, args: &[u64], save: StateSave) -> Vec<u8> {
    // mov rcx / rdx / r8 / r9, imm64
    const ARG_LOADS: [[u8; 2]; MAX_ARGS] = [[0x48, 0xB9], [0x48, 0xBA], [0x49, 0xB8], [0x49, 0xB9]];

    let mut code = Vec::with_capacity(RESULT_OFFSET as usize);

    // pushfq; push rax, rcx, rdx, r8, r9, r10, r11, rbx
    code.extend_from_slice(&[
        0x9C, 0x50, 0x51, 0x52, 0x41, 0x50, 0x41, 0x51, 0x41, 0x52, 0x41, 0x53, 0x53,
    ]);
    // mov rbx, rsp; and rsp, -64; sub rsp, area
    code.extend_from_slice(&[0x48, 0x89, 0xE3, 0x48, 0x83, 0xE4, 0xC0, 0x48, 0x81, 0xEC]);
    code.extend_from_slice(&save.area_size().to_le_bytes());
    save.emit_save(&mut code, true);
    // shadow space
    code.extend_from_slice(&[0x48, 0x83, 0xEC, 0x20]);

    for (load, value) in ARG_LOADS.iter().zip(args) {
        code.extend_from_slice(load);
        code.extend_from_slice(&value.to_le_bytes());
    }

    // mov rax, target; call rax
    code.extend_from_slice(&[0x48, 0xB8]);
    code.extend_from_slice(&target.to_le_bytes());
    code.extend_from_slice(&[0xFF, 0xD0]);

    // mov [result], rax
    code.extend_from_slice(&[0x48, 0xA3]);
    code.extend_from_slice(&(frame + RESULT_OFFSET).to_le_bytes());
    // mov rcx, done; mov dword [rcx], 1
    code.extend_from_slice(&[0x48, 0xB9]);
    code.extend_from_slice(&(frame + DONE_OFFSET).to_le_bytes());
    code.extend_from_slice(&[0xC7, 0x01, 0x01, 0x00, 0x00, 0x00]);

    code.extend_from_slice(&[0x48, 0x83, 0xC4, 0x20]);
    save.emit_restore(&mut code, true);
    // mov rsp, rbx; pop rbx, r11, r10, r9, r8, rdx, rcx, rax; popfq; ret
    code.extend_from_slice(&[
        0x48, 0x89, 0xDC, 0x5B, 0x41, 0x5B, 0x41, 0x5A, 0x41, 0x59, 0x41, 0x58, 0x5A, 0x59, 0x58,
        0x9D, 0xC3,
    ]);

    code
}

/// x86 stub calling the cdecl `target(args...)`.
pub fn x86(frame: u32, target: u32, args: &[u32], save: StateSave) -> Vec<u8> {
    let mut code = Vec::with_capacity(RESULT_OFFSET as usize);

    // pushfd; pushad; mov ebx, esp; and esp, -64; sub esp, area
    code.extend_from_slice(&[0x9C, 0x60, 0x89, 0xE3, 0x83, 0xE4, 0xC0, 0x81, 0xEC]);
    code.extend_from_slice(&save.area_size().to_le_bytes());
    save.emit_save(&mut code, false);

    // keep esp 16-byte aligned at the call
    let padding = (16 - (args.len() * 4) % 16) % 16;
    if padding > 0 {
        code.extend_from_slice(&[0x83, 0xEC, padding as u8]);
    }
    for value in args.iter().rev() {
        code.push(0x68);
        code.extend_from_slice(&value.to_le_bytes());
    }

    // mov eax, target; call eax
    code.push(0xB8);
    code.extend_from_slice(&target.to_le_bytes());
    code.extend_from_slice(&[0xFF, 0xD0]);

    // mov [result], eax
    code.push(0xA3);
    code.extend_from_slice(&(frame + RESULT_OFFSET as u32).to_le_bytes());
    // mov dword [done], 1
    code.extend_from_slice(&[0xC7, 0x05]);
    code.extend_from_slice(&(frame + DONE_OFFSET as u32).to_le_bytes());
    code.extend_from_slice(&1u32.to_le_bytes());

    // drop the cdecl arguments to get back to the save area
    let pushed = padding + args.len() * 4;
    if pushed > 0 {
        code.extend_from_slice(&[0x83, 0xC4, pushed as u8]);
    }
    save.emit_restore(&mut code, false);

    // mov esp, ebx; popad; popfd; ret
    code.extend_from_slice(&[0x89, 0xDC, 0x61, 0x9D, 0xC3]);

    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use monoinject_shared::RemoteAddress;

    const FRAME: u64 = 0x0000_01F0_0000_0000;

    fn position(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|window| window == needle)
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        position(haystack, needle).is_some()
    }

    #[test]
    fn test_marshal_layout() {
        let args = [
            RemoteArg::c_str("C:\\payload\\ExampleAssembly.dll").unwrap(),
            RemoteArg::OutInt32(0),
        ];
        let marshalled = marshal(FRAME, &args).unwrap();

        assert_eq!(marshalled.values, vec![FRAME + DATA_OFFSET, FRAME + OUT_SLOTS_OFFSET]);
        assert_eq!(marshalled.out_slots, vec![(1, FRAME + OUT_SLOTS_OFFSET)]);

        let (address, bytes) = &marshalled.writes[0];
        assert_eq!(*address, FRAME + DATA_OFFSET);
        assert_eq!(bytes.last(), Some(&0));
        assert_eq!(bytes.len(), "C:\\payload\\ExampleAssembly.dll".len() + 1);
    }

    #[test]
    fn test_marshal_strings_are_aligned() {
        let args = [
            RemoteArg::Pointer(RemoteAddress(0x10)),
            RemoteArg::c_str("Example").unwrap(),
            RemoteArg::c_str("Assembly").unwrap(),
        ];
        let marshalled = marshal(FRAME, &args).unwrap();

        assert_eq!(marshalled.values[0], 0x10);
        assert_eq!(marshalled.values[1], FRAME + DATA_OFFSET);
        assert_eq!(marshalled.values[2], FRAME + DATA_OFFSET + 8);
        assert!(marshalled.out_slots.is_empty());
    }

    #[test]
    fn test_marshal_int32_is_zero_extended() {
        let marshalled = marshal(FRAME, &[RemoteArg::Int32(-1)]).unwrap();
        assert_eq!(marshalled.values, vec![0xFFFF_FFFF]);
    }

    #[test]
    fn test_marshal_limits() {
        let args = vec![RemoteArg::null(); MAX_ARGS + 1];
        assert!(matches!(marshal(FRAME, &args), Err(Error::Marshal(_))));

        let huge = "x".repeat(FRAME_SIZE);
        let args = [RemoteArg::c_str(&huge).unwrap()];
        assert!(matches!(marshal(FRAME, &args), Err(Error::Marshal(_))));
    }

    #[test]
    fn test_x64_stub() {
        let target = 0x7FF8_1234_5678u64;
        let code = x64(FRAME, target, &[0x11, 0x22, 0x33, 0x44], StateSave::Fx);

        assert!(code.len() <= RESULT_OFFSET as usize);
        assert_eq!(code.first(), Some(&0x9C));
        assert_eq!(code.last(), Some(&0xC3));

        let mut call = vec![0x48, 0xB8];
        call.extend_from_slice(&target.to_le_bytes());
        call.extend_from_slice(&[0xFF, 0xD0]);
        assert!(contains(&code, &call));

        let mut first_arg = vec![0x48, 0xB9];
        first_arg.extend_from_slice(&0x11u64.to_le_bytes());
        assert!(contains(&code, &first_arg));

        let mut store = vec![0x48, 0xA3];
        store.extend_from_slice(&(FRAME + RESULT_OFFSET).to_le_bytes());
        assert!(contains(&code, &store));

        // fxsave64 [rsp] before the call, fxrstor64 [rsp] after it
        let save = position(&code, &[0x48, 0x0F, 0xAE, 0x04, 0x24]).unwrap();
        let restore = position(&code, &[0x48, 0x0F, 0xAE, 0x0C, 0x24]).unwrap();
        let called = position(&code, &call).unwrap();
        assert!(save < called && called < restore);
        // restored before the stack pointer is put back
        assert!(restore < position(&code, &[0x48, 0x89, 0xDC]).unwrap());
    }

    #[test]
    fn test_x64_stub_with_xsave() {
        let code = x64(FRAME, 0x1000, &[1, 2, 3, 4], StateSave::X);

        assert!(code.len() <= RESULT_OFFSET as usize);
        assert!(contains(&code, &[0x48, 0x81, 0xEC, 0x00, 0x0B, 0x00, 0x00]));
        // mask in eax, then xsave64 / xrstor64 [rsp]
        assert!(contains(&code, &[0xB8, 0xE7, 0x00, 0x00, 0x00, 0x31, 0xD2, 0x48, 0x0F, 0xAE, 0x24, 0x24]));
        assert!(contains(&code, &[0xB8, 0xE7, 0x00, 0x00, 0x00, 0x31, 0xD2, 0x48, 0x0F, 0xAE, 0x2C, 0x24]));
        // the header's last qword is cleared
        assert!(contains(&code, &[0x48, 0x89, 0x84, 0x24, 0x38, 0x02, 0x00, 0x00]));
    }

    #[test]
    fn test_x64_stub_without_args() {
        let code = x64(FRAME, 0x1000, &[], StateSave::Fx);
        let with_args = x64(FRAME, 0x1000, &[1, 2], StateSave::Fx);
        assert_eq!(with_args.len() - code.len(), 20);
    }

    #[test]
    fn test_x86_stub() {
        let code = x86(0x0100_0000, 0x7700_1000, &[0xAA, 0xBB, 0xCC], StateSave::Fx);

        assert!(code.len() <= RESULT_OFFSET as usize);
        assert_eq!(code.last(), Some(&0xC3));
        // three pushes need 4 bytes of padding
        assert!(contains(&code, &[0x83, 0xEC, 0x04]));
        // pushed last to first
        let first = code.iter().position(|b| *b == 0xCC).unwrap();
        let last = code.iter().position(|b| *b == 0xAA).unwrap();
        assert!(first < last);

        let mut done = vec![0xC7, 0x05];
        done.extend_from_slice(&(0x0100_0000u32 + DONE_OFFSET as u32).to_le_bytes());
        assert!(contains(&code, &done));

        // fxsave [esp] on entry, then add esp, 16 and fxrstor [esp] after the call
        let save = position(&code, &[0x0F, 0xAE, 0x04, 0x24]).unwrap();
        let restore = position(&code, &[0x83, 0xC4, 0x10, 0x0F, 0xAE, 0x0C, 0x24]).unwrap();
        assert!(save < first);
        assert!(restore > position(&code, &done).unwrap());
        assert!(restore < position(&code, &[0x89, 0xDC, 0x61, 0x9D, 0xC3]).unwrap());
    }

    #[test]
    fn test_x86_stub_with_xsave() {
        let code = x86(0x0100_0000, 0x7700_1000, &[1, 2, 3, 4], StateSave::X);

        assert!(code.len() <= RESULT_OFFSET as usize);
        assert!(contains(&code, &[0xB8, 0xE7, 0x00, 0x00, 0x00, 0x31, 0xD2, 0x0F, 0xAE, 0x24, 0x24]));
        assert!(contains(&code, &[0xB8, 0xE7, 0x00, 0x00, 0x00, 0x31, 0xD2, 0x0F, 0xAE, 0x2C, 0x24]));
        // four arguments fill the alignment, no padding to drop
        assert!(contains(&code, &[0x83, 0xC4, 0x10, 0xB8, 0xE7]));
    }

    #[test]
    fn test_save_areas_keep_alignment() {
        for save in [StateSave::Fx, StateSave::X] {
            assert_eq!(save.area_size() % 64, 0);
        }
    }
}
