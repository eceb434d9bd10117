use std::env;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use flate2::write::GzEncoder;
use flate2::Compression;
use gzip_template::{Level, TagMap, TagValue, Template};

const SOURCE: &str = "https://{{uid}}.foo.bar.com/?cb={{cb}}{{width}}&width={{width}}&height={{height}}&timeout={{timeout}}&uid={{uid}}&subid={{subid}}&ref={{ref}}";

const VALUES: &[(&str, &[u8])] = &[
    ("cb", b"1234"),
    ("width", b"1232"),
    ("height", b"123"),
    ("timeout", b"123123"),
    ("uid", b"aaasdf"),
    ("subid", b"asdfds"),
    ("ref", b"https://google.com/aaa/bbb/ccc"),
];

struct BenchConfig {
    iters: usize,
    warmups: usize,
    level: Level,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iters: 200_000,
            warmups: 10_000,
            level: Level::BestCompression,
        }
    }
}

impl BenchConfig {
    fn from_args() -> Result<Self, String> {
        let mut cfg = Self::default();
        let mut args = env::args().skip(1);

        while let Some(arg) = args.next() {
            if arg == "--help" || arg == "-h" {
                return Err(help_text());
            }
            // cargo bench passes its own flags through; skip them.
            if arg == "--bench" {
                continue;
            }

            let value = args
                .next()
                .ok_or_else(|| format!("missing value for {arg}"))?;

            match arg.as_str() {
                "--iters" => {
                    cfg.iters = value
                        .parse::<usize>()
                        .map_err(|_| "invalid --iters".to_string())?;
                }
                "--warmups" => {
                    cfg.warmups = value
                        .parse::<usize>()
                        .map_err(|_| "invalid --warmups".to_string())?;
                }
                "--level" => {
                    let raw = value
                        .parse::<i32>()
                        .map_err(|_| "invalid --level".to_string())?;
                    cfg.level = Level::from_raw(raw)
                        .ok_or_else(|| format!("unsupported level {raw}"))?;
                }
                _ => return Err(format!("unknown flag {arg}")),
            }
        }

        Ok(cfg)
    }
}

fn help_text() -> String {
    "usage: throughput [--iters N] [--warmups N] [--level {-2,-1,0,1,9}]".to_string()
}

fn tag_map() -> TagMap {
    let mut map = TagMap::new();
    for (tag, value) in VALUES {
        map.insert(tag.as_bytes().to_vec(), TagValue::Bytes(value.to_vec()));
    }
    map
}

fn report(name: &str, iters: usize, elapsed: Duration, output_bytes: u64) {
    let ns_per_op = elapsed.as_nanos() as f64 / iters as f64;
    let mib_per_s = output_bytes as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64();
    println!("{name:<26} iters={iters} ns_per_op={ns_per_op:.0} out_mib_per_s={mib_per_s:.1}");
}

fn bench<F: FnMut() -> u64>(name: &str, iters: usize, warmups: usize, mut op: F) {
    for _ in 0..warmups {
        op();
    }
    let mut output_bytes = 0u64;
    let start = Instant::now();
    for _ in 0..iters {
        output_bytes += op();
    }
    report(name, iters, start.elapsed(), output_bytes);
}

fn main() {
    let cfg = match BenchConfig::from_args() {
        Ok(cfg) => cfg,
        Err(message) => {
            eprintln!("{message}");
            return;
        }
    };

    let template = Template::new(SOURCE.as_bytes(), b"{{", b"}}", cfg.level)
        .expect("benchmark template should parse");
    let map = tag_map();

    let gz = template
        .execute_to_vec(&map)
        .expect("benchmark execution should succeed");
    let mut plaintext = Vec::new();
    flate2::read::GzDecoder::new(&gz[..])
        .read_to_end(&mut plaintext)
        .expect("benchmark output should decode");
    println!(
        "template={} bytes, expanded={} bytes, gzip member={} bytes, level={:?}",
        SOURCE.len(),
        plaintext.len(),
        gz.len(),
        cfg.level
    );

    // Baseline: compress the fully expanded response from scratch on every
    // request, the way a handler without precompressed segments would.
    bench("recompress_from_scratch", cfg.iters, cfg.warmups, || {
        let mut encoder = GzEncoder::new(io::sink(), match cfg.level {
            Level::NoCompression => Compression::none(),
            Level::BestSpeed | Level::HuffmanOnly => Compression::fast(),
            Level::DefaultCompression => Compression::default(),
            Level::BestCompression => Compression::best(),
        });
        encoder
            .write_all(&plaintext)
            .expect("baseline write should succeed");
        encoder.finish().expect("baseline finish should succeed");
        plaintext.len() as u64
    });

    bench("execute_map_to_sink", cfg.iters, cfg.warmups, || {
        let mut sink = io::sink();
        template
            .execute(&mut sink, &map)
            .expect("execution should succeed")
    });

    bench("execute_func_to_sink", cfg.iters, cfg.warmups, || {
        let mut sink = io::sink();
        template
            .execute_func(&mut sink, |w, tag| {
                for (name, value) in VALUES {
                    if name.as_bytes() == tag {
                        return w.write_all(value);
                    }
                }
                Ok(())
            })
            .expect("execution should succeed")
    });

    bench("execute_map_to_vec", cfg.iters, cfg.warmups, || {
        template
            .execute_to_vec(&map)
            .expect("execution should succeed")
            .len() as u64
    });

    let construction_iters = cfg.iters / 10;
    bench("template_construction", construction_iters.max(1), cfg.warmups / 10, || {
        Template::new(SOURCE.as_bytes(), b"{{", b"}}", cfg.level)
            .expect("benchmark template should parse");
        SOURCE.len() as u64
    });
}
