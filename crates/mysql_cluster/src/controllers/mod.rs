pub mod backup_controller;
pub mod backupschedule_controller;
pub mod cluster_controller;
pub mod control;
pub mod labeler_controller;
pub mod queue;
pub mod restore_controller;
pub mod runner;
pub mod state;
pub mod topology;
pub mod upgrade;
