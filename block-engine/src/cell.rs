// Value Cell
// Synchronized, wait-able storage slot for one block variable

use crate::error::{EngineError, EngineResult};
use crate::model::{Value, Variable};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct CellState {
    value: Value,
    value_set: bool,
    value_changed: bool,
    staged: Option<Value>,
}

/// Storage for one variable. Readers see the committed value; a staged value
/// stays invisible until `commit`.
#[derive(Debug)]
pub struct ValueCell {
    variable: Variable,
    state: Mutex<CellState>,
    /// Bumped on every set or commit so waiters wake
    version: watch::Sender<u64>,
}

impl ValueCell {
    /// New cell, latched with the variable's default value when it has one
    pub fn new(variable: Variable) -> Self {
        let state = match &variable.default_value {
            Some(default) => CellState {
                value: default.clone(),
                value_set: true,
                ..Default::default()
            },
            None => CellState::default(),
        };

        Self {
            variable,
            state: Mutex::new(state),
            version: watch::channel(0).0,
        }
    }

    pub fn variable(&self) -> &Variable {
        &self.variable
    }

    pub fn name(&self) -> &str {
        &self.variable.name
    }

    /// Committed value; `Null` until first set
    pub fn get(&self) -> Value {
        self.state.lock().value.clone()
    }

    pub fn is_set(&self) -> bool {
        self.state.lock().value_set
    }

    pub fn is_changed(&self) -> bool {
        self.state.lock().value_changed
    }

    pub fn clear_changed(&self) {
        self.state.lock().value_changed = false;
    }

    /// Committed value if the cell has been set
    pub fn value_if_set(&self) -> Option<Value> {
        let state = self.state.lock();
        state.value_set.then(|| state.value.clone())
    }

    /// Store a value immediately, discarding anything staged
    pub fn set(&self, value: impl Into<Value>) {
        {
            let mut state = self.state.lock();
            state.value = value.into();
            state.value_set = true;
            state.value_changed = true;
            state.staged = None;
        }
        self.bump();
    }

    /// Hold a value for the next `commit`
    pub fn stage(&self, value: impl Into<Value>) {
        self.state.lock().staged = Some(value.into());
    }

    /// Publish the staged value. Returns false when nothing was staged.
    pub fn commit(&self) -> bool {
        let committed = {
            let mut state = self.state.lock();
            match state.staged.take() {
                Some(value) => {
                    state.value = value;
                    state.value_set = true;
                    state.value_changed = true;
                    true
                }
                None => false,
            }
        };
        if committed {
            self.bump();
        }
        committed
    }

    /// Wait until the cell holds a value, then return it
    pub async fn wait_set(&self, cancel: &CancellationToken) -> EngineResult<Value> {
        // Subscribe before checking so a set racing with the check still wakes us
        let mut changes = self.version.subscribe();

        loop {
            if let Some(value) = self.value_if_set() {
                return Ok(value);
            }

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(EngineError::Cancelled);
                    }
                }
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }
    }

    /// A new cell bound to `variable` holding this cell's committed state
    pub fn clone_for(&self, variable: Variable) -> ValueCell {
        let state = self.state.lock();
        ValueCell {
            variable,
            state: Mutex::new(CellState {
                value: state.value.clone(),
                value_set: state.value_set,
                value_changed: false,
                staged: None,
            }),
            version: watch::channel(0).0,
        }
    }

    /// Committed value presented per the declared data type
    pub fn typed_value(&self) -> Value {
        self.get().coerce_to(self.variable.data_type)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.get().as_string().trim().parse().ok()
    }

    pub fn as_i64(&self) -> Option<i64> {
        let text = self.get().as_string();
        let text = text.trim();
        text.parse::<i64>()
            .ok()
            .or_else(|| text.parse::<f64>().ok().map(|n| n as i64))
    }

    pub fn as_bool(&self) -> Option<bool> {
        let value = self.get();
        value
            .as_bool()
            .or_else(|| value.as_number().map(|n| n != 0.0))
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataType, VariableType};
    use std::sync::Arc;
    use std::time::Duration;

    fn cell(name: &str, data_type: DataType) -> ValueCell {
        ValueCell::new(Variable::new(name, data_type, VariableType::Input))
    }

    #[test]
    fn test_default_value_latches() {
        let variable = Variable::new("N", DataType::Int32, VariableType::Input).with_default(3);
        let cell = ValueCell::new(variable);
        assert!(cell.is_set());
        assert_eq!(cell.as_i64(), Some(3));
        assert!(!cell.is_changed());
    }

    #[test]
    fn test_staged_value_invisible_until_commit() {
        let cell = cell("X", DataType::Int32);
        cell.set(1);
        cell.stage(2);
        assert_eq!(cell.get(), Value::from(1));

        assert!(cell.commit());
        assert_eq!(cell.get(), Value::from(2));
        assert!(!cell.commit());
        assert_eq!(cell.get(), Value::from(2));
    }

    #[test]
    fn test_set_discards_staged_value() {
        let cell = cell("X", DataType::Int32);
        cell.stage(5);
        cell.set(7);
        assert!(!cell.commit());
        assert_eq!(cell.as_i64(), Some(7));
    }

    #[test]
    fn test_numeric_coercion_from_text() {
        let cell = cell("X", DataType::Double);
        cell.set(" 2.5 ");
        assert_eq!(cell.as_f64(), Some(2.5));
        assert_eq!(cell.as_i64(), Some(2));
        assert_eq!(cell.typed_value(), Value::Number(2.5));

        cell.set("abc");
        assert_eq!(cell.as_f64(), None);
        assert_eq!(cell.typed_value(), Value::from("abc"));
    }

    #[test]
    fn test_clone_for_keeps_value() {
        let source = cell("Result", DataType::Int32);
        source.set(15);
        let target = source.clone_for(Variable::new("X", DataType::Int32, VariableType::Input));
        assert_eq!(target.name(), "X");
        assert_eq!(target.as_i64(), Some(15));
        assert!(target.is_set());
    }

    #[tokio::test]
    async fn test_wait_set_wakes_on_set() {
        let cell = Arc::new(cell("X", DataType::Int32));
        let token = CancellationToken::new();

        let writer = Arc::clone(&cell);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.set(42);
        });

        let value = cell.wait_set(&token).await.unwrap();
        assert_eq!(value, Value::from(42));
    }

    #[tokio::test]
    async fn test_wait_set_wakes_on_commit() {
        let cell = Arc::new(cell("X", DataType::Int32));
        let token = CancellationToken::new();

        let writer = Arc::clone(&cell);
        tokio::spawn(async move {
            writer.stage(9);
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.commit();
        });

        assert_eq!(cell.wait_set(&token).await.unwrap(), Value::from(9));
    }

    #[tokio::test]
    async fn test_wait_set_cancellation() {
        let cell = cell("X", DataType::Int32);
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(cell.wait_set(&token).await, Err(EngineError::Cancelled));
    }
}
