use crate::clock::SimTime;

pub type TraceHook<T> = Box<dyn FnMut(SimTime, T) -> anyhow::Result<()>>;

/// A value whose changes are reported to the connected hooks
pub struct TracedValue<T> {
    value: T,
    hooks: Vec<TraceHook<T>>,
}

impl<T: Copy + PartialEq> TracedValue<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            hooks: Vec::new(),
        }
    }

    pub fn get(&self) -> T {
        self.value
    }

    pub fn connect(&mut self, hook: TraceHook<T>) {
        self.hooks.push(hook);
    }

    /// Updates the value, notifying the hooks only if it actually changed
    pub fn set(&mut self, now: SimTime, value: T) -> anyhow::Result<()> {
        if self.value == value {
            return Ok(());
        }

        self.value = value;
        for hook in &mut self.hooks {
            hook(now, value)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_hooks_only_see_changes() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut traced = TracedValue::new(0u32);

        let seen_cp = seen.clone();
        traced.connect(Box::new(move |now, value| {
            seen_cp.borrow_mut().push((now, value));
            Ok(())
        }));

        traced.set(SimTime::from_secs(1), 3).unwrap();
        traced.set(SimTime::from_secs(2), 3).unwrap();
        traced.set(SimTime::from_secs(3), 0).unwrap();

        assert_eq!(traced.get(), 0);
        assert_eq!(
            *seen.borrow(),
            vec![(SimTime::from_secs(1), 3), (SimTime::from_secs(3), 0)]
        );
    }
}
