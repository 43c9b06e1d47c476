//! Boot the kernel on a disk image and run a small self-test.
//!
//! Usage: mekos [--disk PATH] [--format] [--tlb] [--demand] [--swap]
//!              [--lru] [--check] [--ls]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::info;

use mekos_kernel::threads::thread::Thread;
use mekos_kernel::threads::Channel;
use mekos_kernel::{Kernel, KernelConfig};

fn parse_args() -> Result<(KernelConfig, bool, bool)> {
    let mut config = KernelConfig::default();
    let mut check = false;
    let mut ls = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--disk" => {
                let path = args.next().context("--disk needs a path")?;
                config.disk_path = PathBuf::from(path);
            }
            "--format" => config.format_disk = true,
            "--tlb" => config.use_tlb = true,
            "--demand" => {
                config.use_tlb = true;
                config.demand_loading = true;
            }
            "--swap" => {
                config.use_tlb = true;
                config.demand_loading = true;
                config.swap = true;
            }
            "--lru" => config.use_lru = true,
            "--check" => check = true,
            "--ls" => ls = true,
            other => bail!("unknown argument `{other}`"),
        }
    }
    // A disk image that does not exist yet has no filesystem to mount.
    if !config.disk_path.exists() {
        config.format_disk = true;
    }
    Ok((config, check, ls))
}

/// Exercise the thread and filesystem cores end to end: a rendezvous
/// between two forked threads, then a file round trip.
fn self_test(k: &Arc<Kernel>) {
    let channel = Arc::new(Channel::new("self test"));

    let receiver = Thread::new(k, "receiver", true);
    let receiver_channel = Arc::clone(&channel);
    receiver.fork(
        k,
        Box::new(move |k| {
            let message = receiver_channel.receive(k);
            info!("receiver got {message}");
        }),
    );
    channel.send(k, 42);
    receiver.join(k);

    let fs = k.file_system();
    if fs.create(k, "greeting", 0, false).is_ok() {
        let file = fs.open(k, "greeting").expect("open after create");
        let payload = b"hello from the kernel\n";
        assert_eq!(file.write(k, payload), payload.len());
        file.seek(0);
        let mut back = vec![0u8; payload.len()];
        assert_eq!(file.read(k, &mut back), payload.len());
        assert_eq!(&back, payload);
        file.close(k);
        info!("file round trip ok");
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let (config, check, ls) = parse_args()?;
    let kernel = Kernel::boot(config);

    if check {
        let consistent = kernel.file_system().check(&kernel);
        println!(
            "filesystem {}",
            if consistent { "consistent" } else { "INCONSISTENT" }
        );
        if !consistent {
            bail!("filesystem check failed");
        }
    }
    if ls {
        for (name, is_dir) in kernel.file_system().list(&kernel) {
            println!("{name}{}", if is_dir { "/" } else { "" });
        }
        return Ok(());
    }

    self_test(&kernel);
    info!("self test passed");
    Ok(())
}
