//! Process-channel bridge
//!
//! [`spawn`] connects a new counterpart over a private socket pair and proves
//! the connection live with an echo handshake before returning a
//! [`ProcessHandle`]. How the counterpart is started is up to the launcher:
//! [`subprocess_launcher`] forks a real executable, [`plugin_launcher`] runs the
//! handshake on a Tokio task. Both are driven through [`ProcessHandler`].

pub mod echo;
pub mod handler;
pub mod plugin;
pub mod spawn;
pub mod subprocess;

pub use echo::{answer_handshake, request_echo, EchoMessage};
pub use handler::ProcessHandler;
pub use plugin::{plugin_launcher, run_plugin, run_plugin_with_config, PluginHandler};
pub use spawn::{spawn, spawn_with_config, ProcessHandle, SpawnState};
pub use subprocess::{inherited_stream, launch_subprocess, subprocess_launcher, SubprocessHandler};
