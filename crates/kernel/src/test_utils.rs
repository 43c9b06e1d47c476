//! Helpers for exercising a whole kernel from tests and the demo binary.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use crate::config::KernelConfig;
use crate::fs::open_file::OpenFile;
use crate::kernel::Kernel;
use crate::vm::executable;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Boot a freshly formatted kernel on `disk_path` with a silent console.
pub fn boot(disk_path: &Path, tweak: impl FnOnce(&mut KernelConfig)) -> Arc<Kernel> {
    boot_with_io(
        disk_path,
        tweak,
        Box::new(io::empty()),
        Box::new(io::sink()),
    )
}

/// Boot a freshly formatted kernel with the given console streams.
pub fn boot_with_io(
    disk_path: &Path,
    tweak: impl FnOnce(&mut KernelConfig),
    console_input: Box<dyn Read + Send>,
    console_output: Box<dyn Write + Send>,
) -> Arc<Kernel> {
    init_logging();
    let mut config = KernelConfig {
        disk_path: disk_path.to_path_buf(),
        format_disk: true,
        ..KernelConfig::default()
    };
    tweak(&mut config);
    Kernel::boot_with_io(config, console_input, console_output)
}

/// Store an executable image with the given segments on the simulated
/// filesystem.
pub fn install_executable(
    k: &Kernel,
    name: &str,
    code: &[u8],
    init_data: &[u8],
    uninit_data_size: u32,
) {
    let image = executable::build_image(code, init_data, uninit_data_size);
    k.file_system()
        .create(k, name, image.len() as u32, false)
        .expect("cannot create the executable file");
    let file = k
        .file_system()
        .open(k, name)
        .expect("cannot open the executable file");
    assert_eq!(file.write_at(k, &image, 0), image.len());
    file.close(k);
}

/// Create a file, fill it with `data`, and close it again.
pub fn install_file(k: &Kernel, name: &str, data: &[u8]) {
    k.file_system()
        .create(k, name, data.len() as u32, false)
        .expect("cannot create file");
    let file = k.file_system().open(k, name).expect("cannot open file");
    assert_eq!(file.write_at(k, data, 0), data.len());
    file.close(k);
}

/// Read a whole file into memory.
pub fn slurp(k: &Kernel, file: &OpenFile) -> Vec<u8> {
    let mut data = vec![0u8; file.length() as usize];
    assert_eq!(file.read_at(k, &mut data, 0), data.len());
    data
}
