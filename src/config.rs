//! Allocator configuration.
//!
//! Both sizes are fixed for the lifetime of an allocator. Defaults can be
//! overridden from the environment with `MEMALLOC_TOTAL_SIZE` and
//! `MEMALLOC_PAGE_SIZE` (plain decimal byte counts).

use std::env;

use crate::{
    block::{BLOCK_HEADER_SIZE, MIN_PAYLOAD_SIZE},
    error::ConfigError,
    utils::ALIGNMENT,
};

/// Default arena size (64 MiB).
pub const DEFAULT_TOTAL_SIZE: usize = 64 * 1024 * 1024;

/// Default page size (4 KiB).
pub const DEFAULT_PAGE_SIZE: usize = 4 * 1024;

const TOTAL_SIZE_ENV: &str = "MEMALLOC_TOTAL_SIZE";
const PAGE_SIZE_ENV: &str = "MEMALLOC_PAGE_SIZE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Bytes reserved for the arena.
    pub total_size: usize,
    /// Granularity of recency tracking and eviction.
    pub page_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            total_size: DEFAULT_TOTAL_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Config {
    pub fn new(total_size: usize, page_size: usize) -> Self {
        Self { total_size, page_size }
    }

    /// Defaults overridden by whatever the environment sets. The result is validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(total_size) = env_usize(TOTAL_SIZE_ENV)? {
            config.total_size = total_size;
        }
        if let Some(page_size) = env_usize(PAGE_SIZE_ENV)? {
            config.page_size = page_size;
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks the sizes can back an arena: a power of two page size of at least
    /// one word, and a total size that is a whole number of pages holding at
    /// least one minimal block.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::PageSizeNotPowerOfTwo(self.page_size));
        }
        if self.page_size < ALIGNMENT {
            return Err(ConfigError::PageSizeTooSmall {
                page_size: self.page_size,
                min: ALIGNMENT,
            });
        }
        let min = BLOCK_HEADER_SIZE + MIN_PAYLOAD_SIZE;
        if self.total_size < min {
            return Err(ConfigError::TotalSizeTooSmall {
                total_size: self.total_size,
                min,
            });
        }
        if self.total_size % self.page_size != 0 {
            return Err(ConfigError::TotalSizeNotPageMultiple {
                total_size: self.total_size,
                page_size: self.page_size,
            });
        }
        Ok(())
    }
}

fn env_usize(name: &'static str) -> Result<Option<usize>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(value)) => Err(ConfigError::InvalidEnv {
            name,
            value: value.to_string_lossy().into_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(Ok(()), Config::default().validate());
    }

    #[test]
    fn rejects_bad_page_sizes() {
        assert_eq!(
            Err(ConfigError::PageSizeNotPowerOfTwo(3000)),
            Config::new(3000 * 4, 3000).validate()
        );
        assert_eq!(
            Err(ConfigError::PageSizeTooSmall {
                page_size: 4,
                min: ALIGNMENT
            }),
            Config::new(4096, 4).validate()
        );
    }

    #[test]
    fn rejects_bad_total_sizes() {
        assert_eq!(
            Err(ConfigError::TotalSizeNotPageMultiple {
                total_size: 5000,
                page_size: 4096
            }),
            Config::new(5000, 4096).validate()
        );
        assert!(matches!(
            Config::new(16, 16).validate(),
            Err(ConfigError::TotalSizeTooSmall { .. })
        ));
    }

    #[test]
    fn unset_variable_is_none() {
        assert_eq!(Ok(None), env_usize("MEMALLOC_TEST_VARIABLE_THAT_IS_NEVER_SET"));
    }

    #[test]
    fn set_variables_are_parsed() {
        unsafe { env::set_var("MEMALLOC_TEST_PARSED_SIZE", " 8192 ") };
        assert_eq!(Ok(Some(8192)), env_usize("MEMALLOC_TEST_PARSED_SIZE"));

        unsafe { env::set_var("MEMALLOC_TEST_GARBAGE_SIZE", "4k") };
        assert_eq!(
            Err(ConfigError::InvalidEnv {
                name: "MEMALLOC_TEST_GARBAGE_SIZE",
                value: "4k".to_owned()
            }),
            env_usize("MEMALLOC_TEST_GARBAGE_SIZE")
        );
    }

    // The only test touching the real variables, so nothing races on them.
    #[test]
    fn from_env_overrides_the_defaults() {
        unsafe {
            env::set_var(TOTAL_SIZE_ENV, "1048576");
            env::set_var(PAGE_SIZE_ENV, "8192");
        }
        assert_eq!(Ok(Config::new(1024 * 1024, 8192)), Config::from_env());

        unsafe { env::set_var(PAGE_SIZE_ENV, "lots") };
        assert_eq!(
            Err(ConfigError::InvalidEnv {
                name: PAGE_SIZE_ENV,
                value: "lots".to_owned()
            }),
            Config::from_env()
        );

        unsafe { env::set_var(PAGE_SIZE_ENV, "3000") };
        assert_eq!(Err(ConfigError::PageSizeNotPowerOfTwo(3000)), Config::from_env());

        unsafe {
            env::remove_var(TOTAL_SIZE_ENV);
            env::remove_var(PAGE_SIZE_ENV);
        }
        assert_eq!(Ok(Config::default()), Config::from_env());
    }
}
