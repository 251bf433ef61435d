use crate::ExecutionState;

/// Outcome of one invocation of an action
pub type ActionResult = anyhow::Result<()>;

type PlainFn = Box<dyn FnMut() -> ActionResult + Send>;
type ArgFn<T> = Box<dyn FnMut(&T) -> ActionResult + Send>;
type LabeledFn<T> = Box<dyn FnMut(&str, &T) -> ActionResult + Send>;
type StateFn<T> = Box<dyn FnMut(&T, &ExecutionState) -> ActionResult + Send>;

/// The callable part of a work item.
///
/// Each variant carries exactly what it is invoked with, so a work item never
/// holds an argument or label its action ignores.
pub enum Action<T> {
    /// Called with nothing
    Plain(PlainFn),
    /// Called with the argument
    WithArg { arg: T, f: ArgFn<T> },
    /// Called with a label (e.g. a command name) and the argument
    Labeled { label: String, arg: T, f: LabeledFn<T> },
    /// Called with the argument and the key's execution state
    WithState { arg: T, f: StateFn<T> },
}

impl<T> Action<T> {
    pub fn plain<F>(f: F) -> Self
    where
        F: FnMut() -> ActionResult + Send + 'static,
    {
        Action::Plain(Box::new(f))
    }

    pub fn with_arg<F>(arg: T, f: F) -> Self
    where
        F: FnMut(&T) -> ActionResult + Send + 'static,
    {
        Action::WithArg {
            arg,
            f: Box::new(f),
        }
    }

    pub fn labeled<F>(label: impl Into<String>, arg: T, f: F) -> Self
    where
        F: FnMut(&str, &T) -> ActionResult + Send + 'static,
    {
        Action::Labeled {
            label: label.into(),
            arg,
            f: Box::new(f),
        }
    }

    pub fn with_state<F>(arg: T, f: F) -> Self
    where
        F: FnMut(&T, &ExecutionState) -> ActionResult + Send + 'static,
    {
        Action::WithState {
            arg,
            f: Box::new(f),
        }
    }

    /// Short name of the call shape, for logs
    pub fn shape(&self) -> &'static str {
        match self {
            Action::Plain(_) => "plain",
            Action::WithArg { .. } => "with_arg",
            Action::Labeled { .. } => "labeled",
            Action::WithState { .. } => "with_state",
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            Action::Labeled { label, .. } => Some(label),
            _ => None,
        }
    }

    pub fn arg(&self) -> Option<&T> {
        match self {
            Action::Plain(_) => None,
            Action::WithArg { arg, .. }
            | Action::Labeled { arg, .. }
            | Action::WithState { arg, .. } => Some(arg),
        }
    }

    /// Run the action once
    pub fn invoke(&mut self, state: &ExecutionState) -> ActionResult {
        match self {
            Action::Plain(f) => f(),
            Action::WithArg { arg, f } => f(arg),
            Action::Labeled { label, arg, f } => f(label, arg),
            Action::WithState { arg, f } => f(arg, state),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Action<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("shape", &self.shape())
            .field("label", &self.label())
            .field("arg", &self.arg())
            .finish()
    }
}
