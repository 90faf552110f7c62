use std::{
    fs::OpenOptions,
    io,
    sync::{Arc, Mutex},
};

use clap::{value_parser, Arg, ArgMatches, Command};
use log::{info, LevelFilter};
use rand::Rng;

use device::{BlockFile, RamDisk};
use fs::{BlockCache, BlockData, BlockDevice, Cache, LogHeader, OpContext, BLOCK_SIZE};

mod device;
mod fs;
mod logger;
#[cfg(test)]
mod test;

const BLOCK_NUM: u32 = 0x4000;
const LOG_BLOCKS: u32 = 60;
const INODE_NUM: u32 = 200;

fn main() -> io::Result<()> {
    let matches = cli().get_matches();

    let level = matches
        .get_one::<String>("log-level")
        .and_then(|level| level.parse::<LevelFilter>().ok());
    logger::init(level);

    match matches.subcommand() {
        Some(("mkfs", sub)) => mkfs(sub),
        Some(("info", sub)) => show_info(sub),
        Some(("recover", sub)) => recover(sub),
        Some(("stress", sub)) => stress(sub),
        _ => unreachable!("subcommand is required"),
    }
}

fn cli() -> Command {
    let image = Arg::new("image")
        .short('i')
        .long("image")
        .help("Disk image file");
    Command::new("Journal Cache Tool")
        .about("Formats, inspects and exercises a journaling block cache image")
        .subcommand_required(true)
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .global(true)
                .value_parser(["off", "error", "warn", "info", "debug", "trace"])
                .help("Overrides the JOURNAL_LOG environment variable"),
        )
        .subcommand(
            Command::new("mkfs")
                .about("Create an empty image")
                .arg(image.clone().required(true))
                .arg(
                    Arg::new("blocks")
                        .long("blocks")
                        .value_parser(value_parser!(u32))
                        .default_value("16384"),
                )
                .arg(
                    Arg::new("log-blocks")
                        .long("log-blocks")
                        .value_parser(value_parser!(u32))
                        .default_value("60"),
                )
                .arg(
                    Arg::new("inodes")
                        .long("inodes")
                        .value_parser(value_parser!(u32))
                        .default_value("200"),
                ),
        )
        .subcommand(
            Command::new("info")
                .about("Print the superblock, the log header and bitmap usage")
                .arg(image.clone().required(true)),
        )
        .subcommand(
            Command::new("recover")
                .about("Replay the log left behind by a crash")
                .arg(image.clone().required(true)),
        )
        .subcommand(
            Command::new("stress")
                .about("Run concurrent random transactions (in memory without --image)")
                .arg(image)
                .arg(
                    Arg::new("blocks")
                        .long("blocks")
                        .value_parser(value_parser!(u32))
                        .default_value("16384"),
                )
                .arg(
                    Arg::new("threads")
                        .long("threads")
                        .value_parser(value_parser!(usize))
                        .default_value("4"),
                )
                .arg(
                    Arg::new("ops")
                        .long("ops")
                        .value_parser(value_parser!(usize))
                        .default_value("200"),
                ),
        )
}

fn open_image(path: &str, len: Option<u32>) -> io::Result<Arc<dyn BlockDevice>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(len.is_some())
        .open(path)?;
    if let Some(blocks) = len {
        file.set_len(blocks as u64 * BLOCK_SIZE as u64)?;
    }
    Ok(Arc::new(BlockFile(Mutex::new(file))))
}

fn image_path(matches: &ArgMatches) -> &str {
    matches
        .get_one::<String>("image")
        .map(String::as_str)
        .unwrap_or_default()
}

fn mkfs(matches: &ArgMatches) -> io::Result<()> {
    let blocks = *matches.get_one::<u32>("blocks").unwrap_or(&BLOCK_NUM);
    let log_blocks = *matches.get_one::<u32>("log-blocks").unwrap_or(&LOG_BLOCKS);
    let inodes = *matches.get_one::<u32>("inodes").unwrap_or(&INODE_NUM);

    let device = open_image(image_path(matches), Some(blocks))?;
    let cache = fs::create(device, blocks, log_blocks, inodes);
    println!("{:#?}", cache.super_block());
    Ok(())
}

fn read_header(device: &Arc<dyn BlockDevice>, log_start: u32) -> LogHeader {
    let mut data = BlockData::zeroed();
    device.read_block(log_start as usize, &mut data);
    LogHeader::load(&data)
}

fn show_info(matches: &ArgMatches) -> io::Result<()> {
    let device = open_image(image_path(matches), None)?;
    let super_block = fs::read_super_block(&device);
    let header = read_header(&device, super_block.log_start);
    println!("{:#?}", super_block);
    println!("pending log entries: {:?}", header.entries());

    // 打开会先重放日志, 所以位图统计反映的是恢复之后的状态
    let cache = fs::open(device);
    let used = cache.bitmap().count_used(cache.as_ref());
    println!(
        "bitmap: {} used, {} free, data area starts at {}",
        used,
        super_block.num_blocks as usize - used,
        super_block.data_start()
    );
    Ok(())
}

fn recover(matches: &ArgMatches) -> io::Result<()> {
    let device = open_image(image_path(matches), None)?;
    let super_block = fs::read_super_block(&device);
    let pending = read_header(&device, super_block.log_start);
    let _cache = fs::open(Arc::clone(&device));
    let after = read_header(&device, super_block.log_start);
    println!(
        "replayed {} log entries {:?}, {} left",
        pending.len(),
        pending.entries(),
        after.len()
    );
    Ok(())
}

fn stress(matches: &ArgMatches) -> io::Result<()> {
    let threads = *matches.get_one::<usize>("threads").unwrap_or(&4);
    let ops = *matches.get_one::<usize>("ops").unwrap_or(&200);
    let cache = match matches.get_one::<String>("image") {
        Some(path) => fs::open(open_image(path, None)?),
        None => {
            let blocks = *matches.get_one::<u32>("blocks").unwrap_or(&BLOCK_NUM);
            let disk: Arc<dyn BlockDevice> = Arc::new(RamDisk::new(blocks as usize));
            fs::create(disk, blocks, LOG_BLOCKS, INODE_NUM)
        }
    };

    let baseline = cache.bitmap().count_used(cache.as_ref());
    std::thread::scope(|s| {
        for _ in 0..threads {
            s.spawn(|| random_transactions(&cache, ops));
        }
    });
    let used = cache.bitmap().count_used(cache.as_ref());
    info!(
        "stress: {} threads x {} ops, {} blocks still cached",
        threads,
        ops,
        cache.get_num_cached_blocks()
    );
    assert_eq!(used, baseline, "bitmap leaked blocks");
    println!("ok: {} used blocks before and after", used);
    Ok(())
}

/// 随机地分配, 写入, 释放; 结束时释放自己分配的所有块
fn random_transactions(cache: &Cache, ops: usize) {
    let mut rng = rand::thread_rng();
    let mut owned = Vec::new();
    for _ in 0..ops {
        let mut ctx = OpContext::new();
        cache.begin_op(&mut ctx);
        if owned.is_empty() || rng.gen_bool(0.6) {
            for _ in 0..rng.gen_range(1..=3) {
                let block_no = cache.alloc(&mut ctx);
                let mut block = cache.acquire(block_no);
                block.data_mut().fill(rng.gen());
                cache.sync(Some(&mut ctx), &block);
                cache.release(block);
                owned.push(block_no);
            }
        } else {
            let block_no = owned.swap_remove(rng.gen_range(0..owned.len()));
            cache.free(&mut ctx, block_no);
        }
        cache.end_op(&mut ctx);
    }
    for chunk in owned.chunks(cache.config().op_max_num_blocks) {
        let mut ctx = OpContext::new();
        cache.begin_op(&mut ctx);
        for &block_no in chunk {
            cache.free(&mut ctx, block_no);
        }
        cache.end_op(&mut ctx);
    }
}
