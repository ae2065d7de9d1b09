//! Task-management operations every bridge exposes.
//!
//! Registered before any provider operations, so controllers can always
//! drive the status store and the skip signal.

use crate::bridge::protocol::Scalar;
use crate::operation::{Operation, ParamType};
use crate::registry::{MethodRegistry, RegistryError};

pub const NO_NEXT_STEP: &str = "No next step available";

pub fn register(registry: &mut MethodRegistry) -> Result<(), RegistryError> {
    registry.register(
        Operation::new("setCurrentStep", &[ParamType::Str], |ctx, args| {
            let step = args.str(0)?;
            ctx.status().set_current_step(step);
            Ok(Scalar::from(format!("Current step: {}", step)))
        })
        .with_description("replace the current step"),
    )?;

    registry.register(
        Operation::new("getCurrentStep", &[], |ctx, _| {
            Ok(Scalar::from(ctx.status().current_step()))
        })
        .with_description("current step"),
    )?;

    registry.register(
        Operation::new("addUpcomingStep", &[ParamType::Str], |ctx, args| {
            let step = args.str(0)?;
            ctx.status().enqueue_upcoming(step);
            Ok(Scalar::from(format!("Added upcoming step: {}", step)))
        })
        .with_description("append to the upcoming queue"),
    )?;

    registry.register(
        Operation::new("getNextStep", &[], |ctx, _| {
            Ok(Scalar::from(
                ctx.status()
                    .dequeue_upcoming()
                    .unwrap_or_else(|| NO_NEXT_STEP.to_string()),
            ))
        })
        .with_description("pop the next upcoming step"),
    )?;

    registry.register(
        Operation::new("peekNextStep", &[], |ctx, _| {
            Ok(Scalar::from(ctx.status().peek_upcoming()))
        })
        .with_description("next upcoming step without removing it"),
    )?;

    registry.register(
        Operation::new("clearUpcomingSteps", &[], |ctx, _| {
            ctx.status().clear_upcoming();
            Ok(Scalar::from("Cleared all upcoming steps"))
        })
        .with_description("empty the upcoming queue"),
    )?;

    registry.register(
        Operation::new("getUpcomingStepsCount", &[], |ctx, _| {
            Ok(Scalar::from(ctx.status().upcoming_len()))
        })
        .with_description("number of upcoming steps"),
    )?;

    registry.register(
        Operation::new("hasUpcomingSteps", &[], |ctx, _| {
            Ok(Scalar::from(ctx.status().has_upcoming()))
        })
        .with_description("whether any step is queued"),
    )?;

    registry.register(
        Operation::new("requestSkip", &[], |ctx, _| {
            ctx.skip().request();
            Ok(Scalar::from("Skip requested"))
        })
        .with_description("ask the running operation to give up"),
    )?;

    registry.register(
        Operation::new("listOperations", &[], |ctx, _| {
            Ok(Scalar::from(ctx.operation_signatures().join("; ")))
        })
        .with_description("registered operations"),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bridge::protocol::Request;
    use crate::dispatcher::Dispatcher;
    use crate::skip::SkipSignal;
    use crate::status::{IDLE_STEP, NO_UPCOMING_STEPS, TaskStatusStore};

    fn call(d: &Dispatcher, method: &str, args: Vec<Scalar>) -> Scalar {
        let resp = d.dispatch(Request::new(method, args));
        resp.result()
            .cloned()
            .unwrap_or_else(|| panic!("{} failed: {:?}", method, resp.error()))
    }

    fn dispatcher(skip: SkipSignal) -> Dispatcher {
        let mut registry = MethodRegistry::new();
        register(&mut registry).unwrap();
        Dispatcher::new(registry, Arc::new(TaskStatusStore::new()), skip)
    }

    #[test]
    fn current_step_roundtrip() {
        let d = dispatcher(SkipSignal::new());
        assert_eq!(call(&d, "getCurrentStep", vec![]), Scalar::from(IDLE_STEP));
        assert_eq!(
            call(&d, "setCurrentStep", vec![Scalar::from("Mining iron")]),
            Scalar::from("Current step: Mining iron")
        );
        assert_eq!(
            call(&d, "getCurrentStep", vec![]),
            Scalar::from("Mining iron")
        );
    }

    #[test]
    fn upcoming_queue_operations() {
        let d = dispatcher(SkipSignal::new());
        assert_eq!(call(&d, "hasUpcomingSteps", vec![]), Scalar::Bool(false));
        assert_eq!(
            call(&d, "peekNextStep", vec![]),
            Scalar::from(NO_UPCOMING_STEPS)
        );
        assert_eq!(call(&d, "getNextStep", vec![]), Scalar::from(NO_NEXT_STEP));

        call(&d, "addUpcomingStep", vec![Scalar::from("step A")]);
        assert_eq!(
            call(&d, "addUpcomingStep", vec![Scalar::from("step B")]),
            Scalar::from("Added upcoming step: step B")
        );
        assert_eq!(call(&d, "getUpcomingStepsCount", vec![]), Scalar::Int(2));
        assert_eq!(call(&d, "peekNextStep", vec![]), Scalar::from("step A"));
        assert_eq!(call(&d, "getNextStep", vec![]), Scalar::from("step A"));
        assert_eq!(d.status().list_upcoming(), vec!["step B".to_string()]);

        assert_eq!(
            call(&d, "clearUpcomingSteps", vec![]),
            Scalar::from("Cleared all upcoming steps")
        );
        assert_eq!(call(&d, "hasUpcomingSteps", vec![]), Scalar::Bool(false));
    }

    #[test]
    fn request_skip_sets_shared_flag() {
        let skip = SkipSignal::new();
        let d = dispatcher(skip.clone());
        assert_eq!(call(&d, "requestSkip", vec![]), Scalar::from("Skip requested"));
        assert!(skip.is_requested());
    }

    #[test]
    fn list_operations_is_one_line() {
        let d = dispatcher(SkipSignal::new());
        let Scalar::Str(listing) = call(&d, "listOperations", vec![]) else {
            panic!("listOperations should return a string");
        };
        assert!(!listing.contains('\n'));
        assert!(listing.starts_with("setCurrentStep(str) - replace the current step; "));
        assert!(listing.contains("requestSkip() - ask the running operation to give up"));
        assert_eq!(listing.split("; ").count(), 10);
    }

    #[test]
    fn registering_twice_is_rejected() {
        let mut registry = MethodRegistry::new();
        register(&mut registry).unwrap();
        assert!(matches!(
            register(&mut registry),
            Err(RegistryError::Duplicate { .. })
        ));
    }
}
