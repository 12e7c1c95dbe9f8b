//! Общие константы движка (страницы, имена файлов в корне, meta).

// -------- Pages --------
/// Размер страницы региона. Совпадает с размером страницы MMU на поддерживаемых платформах
/// (проверяется при включении аппаратных ловушек).
pub const PAGE_SIZE: usize = 4096;

// -------- Files in engine root --------
pub const META_FILE: &str = "nvmeta";
pub const LOG_FILE: &str = "nvlog-000001.log";
pub const IMAGE_FILE: &str = "region.img";
pub const LOCK_FILE: &str = "LOCK";

// Process files: <prefix><pid>.shm
pub const STATS_FILE_PREFIX: &str = "stats-";
pub const METADATA_FILE_PREFIX: &str = "metadata-";
pub const PROCESS_FILE_EXT: &str = "shm";
pub const PROCESS_FILE_PAGES: usize = 16;

// -------- Epochs --------
/// Эпоха 0 — "ничего не закоммичено". Первая закрытая эпоха имеет номер 1.
pub const NO_EPOCH: u64 = 0;
