use anyhow::Result;
use serde_json::json;
use std::path::PathBuf;

use nvthreads::diff::DiffBody;
use nvthreads::plog::{log_path, scan_log};

pub fn exec(path: PathBuf, json: bool) -> Result<()> {
    let scan = scan_log(&log_path(&path))?;

    if json {
        let epochs: Vec<_> = scan
            .epochs
            .iter()
            .map(|e| {
                json!({
                    "epoch": e.epoch,
                    "start": e.start,
                    "end": e.end,
                    "allocs": e.allocs,
                    "diffs": e.diffs.iter().map(|d| json!({
                        "page_id": d.page_id,
                        "whole_page": d.is_whole_page(),
                        "changed_bytes": d.changed_bytes(),
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        let v = json!({
            "instance_id": format!("{:#018x}", scan.instance_id),
            "valid_len": scan.valid_len,
            "torn_bytes": scan.torn_bytes,
            "epochs": epochs,
        });
        println!("{}", serde_json::to_string_pretty(&v)?);
        return Ok(());
    }

    for e in &scan.epochs {
        println!(
            "epoch {:>8}  [{}..{})  {} alloc(s)  {} diff(s)",
            e.epoch,
            e.start,
            e.end,
            e.allocs.len(),
            e.diffs.len()
        );
        for a in &e.allocs {
            println!("    alloc  '{}' offset={} size={}", a.name, a.offset, a.size);
        }
        for d in &e.diffs {
            match &d.body {
                DiffBody::WholePage(_) => println!("    page {:>6}  whole page", d.page_id),
                DiffBody::Ranges(rs) => {
                    let spans: Vec<String> = rs
                        .iter()
                        .map(|r| format!("{}+{}", r.offset, r.bytes.len()))
                        .collect();
                    println!("    page {:>6}  {}", d.page_id, spans.join(" "));
                }
            }
        }
    }
    if scan.torn_bytes > 0 {
        println!("torn tail: {} byte(s) after offset {}", scan.torn_bytes, scan.valid_len);
    }
    Ok(())
}
