// Базовые модули
pub mod consts;
pub mod config;
pub mod meta;
pub mod lock;
pub mod metrics;

// Движок согласованности
pub mod region;  // анонимный регион страниц, mprotect
pub mod trap;    // контракт ловушки: адрес -> FaultAction
pub mod signal;  // доставка SIGSEGV (аппаратный режим)
pub mod twin;    // пул twin-страниц
pub mod diff;    // диффы страница/twin
pub mod tracker; // Page Access Tracker
pub mod plog;    // src/plog/{mod,encode,reader,writer,replay}.rs
pub mod image;   // region.img + компактация
pub mod recovery;
pub mod coordinator;
pub mod registry; // src/registry/{mod,threads,sync}.rs
pub mod alloc;
pub mod stats;   // process-файлы stats/metadata
pub mod engine;
pub mod runtime;

// C ABI — включается фичей "ffi"
#[cfg(feature = "ffi")]
pub mod ffi;

// Удобные реэкспорты
pub use config::{CommitPolicy, EngineBuilder, EngineConfig, TrapMode};
pub use coordinator::{CloseOutcome, Trigger};
pub use engine::{Engine, NvAlloc};
pub use metrics::MetricsSnapshot;
pub use recovery::{reconstruct, RecoveryReport};
pub use registry::{OpStatus, SyncId, ThreadId};
