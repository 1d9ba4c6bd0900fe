mod boot_hook;
mod command;
mod fs_utils;
mod journal;
mod layout;
mod lock;
mod reboot;
mod state_store;

pub use boot_hook::{BootHook, BootScheduler, SchedulingError, SystemdBootScheduler};
pub use command::{
    output_tail, CommandError, CommandOutput, CommandRunner, CommandSpec, SystemCommandRunner,
    DIAGNOSTIC_TAIL_LINES,
};
pub use fs_utils::{atomic_temp_path, remove_file_if_exists, write_atomic};
pub use journal::{current_unix_timestamp, JournalEntry, JournalEvent, RunJournal};
pub use layout::HostLayout;
pub use lock::{
    current_pid, process_is_alive, read_lock_owner, LockAcquired, LockGuard, LockManager,
    PidFileLock,
};
pub use reboot::{Rebooter, ShutdownRebooter};
pub use state_store::{FileStateStore, StateStore};
