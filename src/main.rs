use std::fs;
use std::io::{self, prelude::*};
use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use rec_sort::{ExternalSorter, ExternalSorterBuilder, MemoryLimit, Record, SortConfig};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let column: usize = arg_parser.value_of_t_or_exit("column");
    let delimiter = arg_parser
        .value_of("delimiter")
        .expect("value is required")
        .chars()
        .next()
        .expect("value is pre-validated");
    let tmp_dir: Option<&str> = arg_parser.value_of("tmp_dir");
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));

    let memory_limit = arg_parser
        .value_of("memory_limit")
        .expect("value is required")
        .parse::<ByteSize>()
        .expect("value is pre-validated")
        .as_u64();
    let memory_available = match arg_parser.value_of("memory_available") {
        Some(value) => value.parse::<ByteSize>().expect("value is pre-validated").as_u64(),
        None => memory_limit,
    };

    let input = arg_parser.value_of("input").expect("value is required");
    let input_stream = match fs::File::open(input) {
        Ok(file) => io::BufReader::new(file),
        Err(err) => {
            log::error!("input file opening error: {}", err);
            process::exit(1);
        }
    };

    let config = SortConfig::new(column, MemoryLimit::Bytes(memory_limit), memory_available);

    let mut sorter_builder = ExternalSorterBuilder::new(config);
    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }
    if let Some(tmp_dir) = tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }

    let sorter: ExternalSorter<io::Error> = match sorter_builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    let sorted_stream = match sorter.sort(
        input_stream
            .lines()
            .map(|line| line.map(|line| Record::from_line(&line, delimiter))),
    ) {
        Ok(sorted_stream) => sorted_stream,
        Err(err) => {
            log::error!("data sorting error: {}", err);
            process::exit(1);
        }
    };

    // the output file is only created once every run has been written, so
    // an aborted sort leaves no output artifact behind
    let output = arg_parser.value_of("output").expect("value is required");
    let mut output_stream = match fs::File::create(output) {
        Ok(file) => io::BufWriter::new(file),
        Err(err) => {
            log::error!("output file creation error: {}", err);
            process::exit(1);
        }
    };

    for record in sorted_stream {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                log::error!("merge stream error: {}", err);
                process::exit(1);
            }
        };
        if let Err(err) = output_stream.write_all(format!("{}\n", record.to_line(delimiter)).as_bytes()) {
            log::error!("data saving error: {}", err);
            process::exit(1);
        };
    }

    if let Err(err) = output_stream.flush() {
        log::error!("data flushing error: {}", err);
        process::exit(1);
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("rec-sort")
        .about("external sorter for delimited record files")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("column")
                .short('k')
                .long("column")
                .help("zero-based index of the sort key column")
                .takes_value(true)
                .default_value("0")
                .validator(|v| match v.parse::<usize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("column index incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("delimiter")
                .long("delimiter")
                .help("field delimiter")
                .takes_value(true)
                .default_value(",")
                .validator(|v| {
                    if v.chars().count() == 1 {
                        Ok(())
                    } else {
                        Err("delimiter must be a single character".to_string())
                    }
                }),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store run data")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("memory_limit")
                .short('m')
                .long("memory-limit")
                .help("per-block memory limit")
                .required(true)
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("memory limit format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("memory_available")
                .short('a')
                .long("memory-available")
                .help("memory considered available to the sort (defaults to the memory limit)")
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("memory size format incorrect: {}", err)),
                }),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
