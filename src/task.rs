//! Task lifecycle: the child process handle, stdin forwarding, and the
//! state machine that coordinates debounced reloads.

mod child;
mod sm;
mod stdin;

pub(crate) use sm::StateMachine;
pub(crate) use stdin::StdinBroker;
