use anyhow::Result;
use serde_json::json;
use std::path::PathBuf;

use nvthreads::image::read_image;
use nvthreads::lock::{is_locked, last_holder};
use nvthreads::meta::read_meta;
use nvthreads::plog::{log_path, scan_log};
use nvthreads::stats::{read_metadata, read_stats_slots, stale_process_files};

pub fn exec(path: PathBuf, json: bool) -> Result<()> {
    let m = read_meta(&path)?;
    let scan = scan_log(&log_path(&path))?;
    let image = read_image(&path)?;
    let running = is_locked(&path);
    let holder = last_holder(&path);
    // pid 0 не бывает у живого процесса: получаем все process-файлы.
    let files = stale_process_files(&path, 0)?;

    let mut procs = Vec::new();
    for (pid, p) in &files {
        let name = p.file_name().and_then(|s| s.to_str()).unwrap_or("");
        if name.starts_with(nvthreads::consts::METADATA_FILE_PREFIX) {
            procs.push(json!({ "pid": pid, "metadata": read_metadata(p)? }));
        } else {
            procs.push(json!({ "pid": pid, "stats_slots": read_stats_slots(p)? }));
        }
    }

    if json {
        let v = json!({
            "meta": {
                "version": m.version,
                "page_size": m.page_size,
                "region_pages": m.region_pages,
                "last_epoch": m.last_epoch,
                "clean_shutdown": m.clean_shutdown,
                "instance_id": format!("{:#018x}", m.instance_id),
            },
            "log": {
                "file_len": scan.file_len,
                "valid_len": scan.valid_len,
                "torn_bytes": scan.torn_bytes,
                "clean_tail": scan.clean_tail,
                "epochs": scan.epochs.len(),
                "last_epoch": scan.last_epoch,
                "shutdown_epoch": scan.shutdown_epoch,
            },
            "running": running,
            "last_lock_holder": holder,
            "image_epoch": image.as_ref().map(|i| i.epoch),
            "process_files": procs,
        });
        println!("{}", serde_json::to_string_pretty(&v)?);
        return Ok(());
    }

    println!("root:            {}", path.display());
    match (running, holder) {
        (true, Some(pid)) => println!("engine:          running (pid {})", pid),
        (true, None) => println!("engine:          running"),
        (false, _) => println!("engine:          not running"),
    }
    println!("region:          {} page(s) x {} B", m.region_pages, m.page_size);
    println!("last epoch:      {} (meta)", m.last_epoch);
    println!("clean shutdown:  {}", m.clean_shutdown);
    println!("instance id:     {:#018x}", m.instance_id);
    match &image {
        Some(i) => println!("image:           epoch {}, {} alloc(s)", i.epoch, i.allocs.len()),
        None => println!("image:           none"),
    }
    println!(
        "log:             {} epoch(s), last {}, {} / {} byte(s) valid, torn {}",
        scan.epochs.len(),
        scan.last_epoch,
        scan.valid_len,
        scan.file_len,
        scan.torn_bytes
    );
    if let Some(e) = scan.shutdown_epoch {
        println!("shutdown marker: epoch {}", e);
    }
    println!("process files:   {}", files.len());
    for (pid, p) in &files {
        println!("  pid {:>8}  {}", pid, p.display());
    }
    Ok(())
}
