// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Runtime configuration.
//!
//! A configuration is a whitespace separated list of `key=value` pairs, e.g.
//! `concurrency=4 quantum_ms=10 log=debug`. [`Config::from_env`] reads it
//! from the `MNTHREADS` environment variable.

use core::str::FromStr;
use core::time::Duration;

use log::{error, LevelFilter};
use logos::Logos;

use crate::error::{ThrError, ThrResult};
use crate::stack::{DEFAULT_STACK_SIZE_BYTES, MIN_STACK_SIZE_BYTES};

/// Name of the environment variable consulted by [`Config::from_env`].
pub const CONFIG_ENV: &str = "MNTHREADS";

/// Tokens of a configuration string.
#[derive(Logos, Debug, PartialEq, Clone, Copy)]
enum ConfigToken {
    /// Number of KSEs in the primary group.
    #[token("concurrency")]
    Concurrency,

    /// Time slice in milliseconds.
    #[token("quantum_ms")]
    Quantum,

    /// Longest time an idle KSE sleeps before re-checking its group.
    #[token("idle_ms")]
    Idle,

    #[token("kse_cache")]
    KseCache,

    #[token("kseg_cache")]
    KsegCache,

    #[token("thread_cache")]
    ThreadCache,

    /// Number of dead threads that triggers a GC pass.
    #[token("gc")]
    Gc,

    #[token("max_threads")]
    MaxThreads,

    /// Default stack size of new threads.
    #[token("stack")]
    Stack,

    /// Policy for self-relocking a normal mutex.
    #[token("deadlock")]
    Deadlock,

    /// Log level
    #[token("log")]
    Log,

    #[regex("[a-zA-Z0-9\\._-]+")]
    Ident,

    #[token("=", priority = 22)]
    KVSeparator,

    #[regex(r#"'[^']*'"#)]
    LiteralString,

    /// Anything not properly encoded
    #[error]
    #[regex(r"[ \t\n]+", logos::skip)]
    Error,
}

/// What happens when a thread locks a normal mutex it already owns.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeadlockPolicy {
    /// Report [`ThrError::Deadlock`].
    Error,
    /// Park the thread forever in the `Deadlock` state.
    Park,
}

impl From<&str> for DeadlockPolicy {
    fn from(s: &str) -> Self {
        match s {
            "park" => DeadlockPolicy::Park,
            "error" => DeadlockPolicy::Error,
            _ => DeadlockPolicy::Error,
        }
    }
}

/// Tunables of a [`crate::Runtime`].
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Initial number of KSEs in the primary group.
    pub concurrency: usize,
    /// Time slice of `Other`/`RoundRobin` threads.
    pub quantum: Duration,
    /// Upper bound for how long an idle KSE parks before re-checking.
    pub idle_timeout: Duration,
    /// High-water mark of the KSE free list.
    pub kse_cache: usize,
    /// High-water mark of the KSEG free list.
    pub kseg_cache: usize,
    /// High-water mark of the carrier (thread) free list.
    pub thread_cache: usize,
    /// Number of dead threads that triggers an opportunistic GC pass.
    pub gc_watermark: usize,
    /// Maximum number of live threads.
    pub max_threads: usize,
    /// Stack size for threads that don't ask for one.
    pub stack_size: usize,
    pub deadlock: DeadlockPolicy,
    /// Applied with `log::set_max_level` when the runtime starts.
    pub log_filter: Option<LevelFilter>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            concurrency: num_cpus::get().max(1),
            quantum: Duration::from_millis(20),
            idle_timeout: Duration::from_secs(60),
            kse_cache: 50,
            kseg_cache: 50,
            thread_cache: 100,
            gc_watermark: 5,
            max_threads: 4096,
            stack_size: DEFAULT_STACK_SIZE_BYTES,
            deadlock: DeadlockPolicy::Error,
            log_filter: None,
        }
    }
}

fn parse_number(key: ConfigToken, value: &str) -> ThrResult<usize> {
    value.parse::<usize>().map_err(|_e| {
        error!("Invalid value for {:?}: '{}'", key, value);
        ThrError::InvalidArgument
    })
}

impl Config {
    /// Reads the configuration from `MNTHREADS`, falling back to defaults if
    /// the variable is absent or malformed.
    pub fn from_env() -> Self {
        match std::env::var(CONFIG_ENV) {
            Ok(args) => Config::from_str(&args).unwrap_or_else(|e| {
                error!("Ignoring {}='{}': {}", CONFIG_ENV, args, e);
                Config::default()
            }),
            Err(_) => Config::default(),
        }
    }

    fn apply(&mut self, key: ConfigToken, value: &str) -> ThrResult<()> {
        match key {
            ConfigToken::Concurrency => {
                self.concurrency = parse_number(key, value)?;
                if self.concurrency == 0 {
                    return Err(ThrError::InvalidArgument);
                }
            }
            ConfigToken::Quantum => {
                self.quantum = Duration::from_millis(parse_number(key, value)? as u64)
            }
            ConfigToken::Idle => {
                self.idle_timeout = Duration::from_millis(parse_number(key, value)? as u64)
            }
            ConfigToken::KseCache => self.kse_cache = parse_number(key, value)?,
            ConfigToken::KsegCache => self.kseg_cache = parse_number(key, value)?,
            ConfigToken::ThreadCache => self.thread_cache = parse_number(key, value)?,
            ConfigToken::Gc => self.gc_watermark = parse_number(key, value)?.max(1),
            ConfigToken::MaxThreads => self.max_threads = parse_number(key, value)?,
            ConfigToken::Stack => {
                self.stack_size = parse_number(key, value)?;
                if self.stack_size < MIN_STACK_SIZE_BYTES {
                    error!("Stack size {} is too small", self.stack_size);
                    return Err(ThrError::InvalidArgument);
                }
            }
            ConfigToken::Deadlock => self.deadlock = value.into(),
            ConfigToken::Log => {
                self.log_filter = Some(LevelFilter::from_str(value).map_err(|_e| {
                    error!("Invalid log filter '{}'", value);
                    ThrError::InvalidArgument
                })?)
            }
            _ => return Err(ThrError::InvalidArgument),
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ThrError;

    /// Parse a configuration string.
    ///
    /// Example: `log=trace concurrency=2` sets the log level to
    /// `LevelFilter::Trace` and uses two KSEs in the primary group.
    fn from_str(args: &str) -> ThrResult<Self> {
        let mut parsed: Config = Default::default();
        let mut lexer = ConfigToken::lexer(args);
        let mut prev = ConfigToken::Error;
        let mut separated = false;

        while let Some(token) = lexer.next() {
            let slice = lexer.slice();

            match token {
                ConfigToken::Ident | ConfigToken::LiteralString => {
                    if prev == ConfigToken::Error || !separated {
                        error!("Invalid config: {} (unexpected '{}')", args, slice);
                        return Err(ThrError::InvalidArgument);
                    }
                    let value = if token == ConfigToken::LiteralString {
                        // We strip the quotes with 1..slice.len()-1
                        &slice[1..slice.len() - 1]
                    } else {
                        slice
                    };
                    parsed.apply(prev, value)?;
                    prev = ConfigToken::Error;
                    separated = false;
                }
                ConfigToken::KVSeparator => {
                    if prev == ConfigToken::Error || separated {
                        error!(
                            "Malformed config (unexpected equal sign) in `{}` previous token was {:?}",
                            args, prev
                        );
                        return Err(ThrError::InvalidArgument);
                    }
                    separated = true;
                }
                ConfigToken::Error => {
                    error!(
                        "Malformed config! Encountered '{}' while parsing: {}",
                        slice, args
                    );
                    return Err(ThrError::InvalidArgument);
                }
                key => {
                    if prev != ConfigToken::Error {
                        error!("Config key {:?} has no value in `{}`", prev, args);
                        return Err(ThrError::InvalidArgument);
                    }
                    prev = key;
                }
            }
        }

        if prev != ConfigToken::Error {
            error!("Config key {:?} has no value in `{}`", prev, args);
            return Err(ThrError::InvalidArgument);
        }

        Ok(parsed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_empty() {
        let c = Config::from_str("").expect("failed to parse config");
        assert_eq!(c, Config::default());
        assert!(c.concurrency >= 1);
    }

    #[test]
    fn parse_basic() {
        let c = Config::from_str("concurrency=3 quantum_ms=5 log=debug")
            .expect("failed to parse config");
        assert_eq!(c.concurrency, 3);
        assert_eq!(c.quantum, Duration::from_millis(5));
        assert_eq!(c.log_filter, Some(LevelFilter::Debug));
        assert_eq!(c.deadlock, DeadlockPolicy::Error);
    }

    #[test]
    fn parse_literal_and_caches() {
        let c = Config::from_str("deadlock='park' kse_cache=2 kseg_cache=3 thread_cache=4 gc=1")
            .expect("failed to parse config");
        assert_eq!(c.deadlock, DeadlockPolicy::Park);
        assert_eq!(c.kse_cache, 2);
        assert_eq!(c.kseg_cache, 3);
        assert_eq!(c.thread_cache, 4);
        assert_eq!(c.gc_watermark, 1);
    }

    #[test]
    fn parse_invalid_key() {
        assert!(Config::from_str("concurency=3").is_err());
    }

    #[test]
    fn parse_invalid_number() {
        assert_eq!(
            Config::from_str("max_threads=lots"),
            Err(ThrError::InvalidArgument)
        );
        assert_eq!(
            Config::from_str("concurrency=0"),
            Err(ThrError::InvalidArgument)
        );
    }

    #[test]
    fn parse_missing_value() {
        assert!(Config::from_str("concurrency=").is_err());
        assert!(Config::from_str("concurrency gc=2").is_err());
        assert!(Config::from_str("=2").is_err());
    }

    #[test]
    fn parse_small_stack() {
        assert!(Config::from_str("stack=128").is_err());
        let c = Config::from_str("stack=1048576").expect("failed to parse config");
        assert_eq!(c.stack_size, 1 << 20);
    }
}
