use clap::{ArgGroup, Parser};
use csplat_lib::codec::{decode, encode, CompressionLevel, EncodeConfig};
use csplat_lib::common::ZSTD_MAX_COMPRESSION_LVL;
use csplat_lib::ingest;
use csplat_lib::store::SplatStore;
use std::cmp::min;
use std::error::Error;
use std::fs;
use std::path::Path;
use std::process;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(
    name = "Compact Splat Converter",
    version = "1.0",
    about = "Converts .ply/.splat splat scenes to and from the compact csplat format"
)]
#[command(group(
    ArgGroup::new("mode").required(true).args(&["encode", "decode"])
))]
struct Cli {
    #[arg(short = 'e', long = "encode", help = "Enable encoding mode.")]
    encode: bool,

    #[arg(short = 'd', long = "decode", help = "Enable decoding mode (writes a PLY).")]
    decode: bool,

    #[arg(
        short = 'i',
        long = "input",
        value_name = "INPUT",
        required = true,
        help = "Path to the input file."
    )]
    input: String,

    #[arg(
        short = 'o',
        long = "output",
        value_name = "OUTPUT",
        required = true,
        help = "Path to the output file."
    )]
    output: String,

    #[arg(
        short = 'c',
        long = "compression-level",
        value_name = "LEVEL",
        default_value = "0",
        help = "Compression level: 0 keeps original precision, 1 quantizes to 16-bit, 2 additionally squeezes harmonics to 8-bit."
    )]
    compression_level: u8,

    #[arg(
        short = 'a',
        long = "alpha-threshold",
        value_name = "THRESHOLD",
        default_value = "1",
        help = "Splats with opacity below this (0-255) are removed during encoding."
    )]
    alpha_threshold: u8,

    #[arg(
        long = "scene-center",
        value_name = "X,Y,Z",
        default_value = "0,0,0",
        help = "Center of the spatial bucketing grid."
    )]
    scene_center: String,

    #[arg(
        long = "block-size",
        value_name = "SIZE",
        default_value = "5.0",
        help = "Edge length of the spatial bucketing grid cells."
    )]
    block_size: f32,

    #[arg(
        long = "bucket-size",
        value_name = "COUNT",
        default_value = "256",
        help = "Splats per quantization bucket."
    )]
    bucket_size: u32,

    #[arg(
        short = 's',
        long = "sh-degree",
        value_name = "DEGREE",
        default_value = "0",
        help = "Target spherical harmonics degree (0-2)."
    )]
    sh_degree: u8,

    #[arg(
        short = 'z',
        long = "zstd-level",
        value_name = "LEVEL",
        default_value = "3",
        help = "Zstandard level for the outer frame."
    )]
    zstd_level: u32,

    #[arg(
        short = 'w',
        long = "workers",
        value_name = "WORKERS",
        default_value = "3",
        help = "Worker count for Zstandard."
    )]
    workers: u32,
}

fn parse_center(s: &str) -> Result<[f32; 3], Box<dyn Error + Send + Sync>> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 3 {
        return Err(format!("scene center '{}' is not of the form x,y,z", s).into());
    }
    let mut center = [0.0f32; 3];
    for (c, p) in center.iter_mut().zip(&parts) {
        *c = p.trim().parse()?;
    }
    Ok(center)
}

fn run_encode(cli: &Cli, raw_data: &[u8]) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let section = match Path::new(&cli.input)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("splat") => ingest::parse_splat_stream(raw_data, cli.alpha_threshold)?,
        _ => ingest::parse_ply(raw_data, cli.alpha_threshold, cli.sh_degree)?,
    };
    let mut store = SplatStore::new(ingest::sh_degree_of(&section).min(cli.sh_degree));
    store.append_section(section)?;
    println!(
        "Loaded {} splats at SH degree {}",
        store.total_count(),
        store.sh_degree()
    );

    let config = EncodeConfig {
        level: CompressionLevel::from_u8(cli.compression_level)?,
        alpha_threshold: cli.alpha_threshold,
        sh_degree: cli.sh_degree,
        block_size: cli.block_size,
        bucket_size: cli.bucket_size,
        scene_center: parse_center(&cli.scene_center)?,
        zstd_level: min(cli.zstd_level, ZSTD_MAX_COMPRESSION_LVL),
        zstd_workers: cli.workers,
    };
    Ok(encode(&store, &config)?)
}

fn run_decode(raw_data: &[u8]) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let store = decode(raw_data)?;
    println!(
        "Decoded {} splats in {} sections",
        store.total_count(),
        store.sections().len()
    );
    Ok(ingest::export_ply(&store)?)
}

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let raw_data = fs::read(&cli.input).unwrap_or_else(|e| {
        eprintln!("Error reading input file {}: {}", cli.input, e);
        process::exit(1);
    });

    let op = if cli.encode { "Encoding" } else { "Decoding" };
    println!("Mode: {} | Input: {} | Output: {}", op, cli.input, cli.output);
    if cli.encode {
        println!(
            "Level: {} | Alpha threshold: {} | Bucket size: {}",
            cli.compression_level, cli.alpha_threshold, cli.bucket_size
        );
    }

    let start = Instant::now();
    let result = if cli.encode {
        run_encode(&cli, &raw_data)?
    } else {
        run_decode(&raw_data)?
    };
    let elapsed = start.elapsed().as_millis();
    println!("{} Time: {} ms", op, elapsed);

    fs::write(&cli.output, &result).unwrap_or_else(|e| {
        eprintln!("Error writing output '{}': {}", cli.output, e);
        process::exit(1);
    });
    println!("Successfully wrote to '{}'.", cli.output);

    Ok(())
}
