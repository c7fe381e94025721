use zwh_core::prelude::*;
use zwh_core::state_machine;
use zwh_core::state_machine::StateMachine;
use zwh_serial::prelude::*;

/// How one transaction attempt against the Serial API ended
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, PartialEq)]
pub enum SerialApiMachineResult {
    Success(Option<Message>),
    ACKTimeout,
    CAN,
    NAK,
    ResponseTimeout,
    ResponseNOK(Message),
    CallbackTimeout,
    CallbackNOK(Message),
}

impl SerialApiMachineResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, SerialApiMachineResult::Success(_))
    }
}

state_machine! { SerialApiMachine {
    State = {
        Initial,
        WaitingForACK,
        WaitingForResponse,
        WaitingForCallback,
        Done(SerialApiMachineResult),
    },
    Input = {
        Start,
        ACK,
        NAK,
        CAN,
        Timeout,
        Response(Message),
        ResponseNOK(Message),
        Callback(Message),
        CallbackNOK(Message),
    },
    Effect = {},
    Condition = {
        ExpectsResponse,
        ExpectsCallback,
    },
    Transitions = [
        [Initial => [
            [Start => WaitingForACK],
        ]],
        [WaitingForACK => [
            [ACK if ExpectsResponse => WaitingForResponse],
            [ACK if ExpectsCallback => WaitingForCallback],
            [ACK => Done(SerialApiMachineResult::Success(None))],
            [NAK => Done(SerialApiMachineResult::NAK)],
            [CAN => Done(SerialApiMachineResult::CAN)],
            [Timeout => Done(SerialApiMachineResult::ACKTimeout)],
        ]],
        [WaitingForResponse => [
            [Response(_) if ExpectsCallback => WaitingForCallback],
            [Response(msg) => Done(SerialApiMachineResult::Success(Some(msg)))],
            [ResponseNOK(msg) => Done(SerialApiMachineResult::ResponseNOK(msg))],
            [Timeout => Done(SerialApiMachineResult::ResponseTimeout)],
        ]],
        [WaitingForCallback => [
            [Callback(msg) => Done(SerialApiMachineResult::Success(Some(msg)))],
            [CallbackNOK(msg) => Done(SerialApiMachineResult::CallbackNOK(msg))],
            [Timeout => Done(SerialApiMachineResult::CallbackTimeout)],
        ]],
    ],
    Delays = [],
    Initial = Initial,
    Final = Done(_)
} }

#[cfg(test)]
mod test {
    use super::*;
    use zwh_core::state_machine::StateMachine;
    use zwh_core::state_machine::StateMachineTransition;

    #[test]
    fn test_happy_path_with_callback() {
        let mut machine = SerialApiMachine::new();
        let eval = |condition: SerialApiMachineCondition| match condition {
            SerialApiMachineCondition::ExpectsResponse => true,
            SerialApiMachineCondition::ExpectsCallback => true,
        };

        let t = machine.next(SerialApiMachineInput::Start, eval).unwrap();
        machine.transition(t.new_state());
        assert_eq!(machine.state(), &SerialApiMachineState::WaitingForACK);

        let t = machine.next(SerialApiMachineInput::ACK, eval).unwrap();
        machine.transition(t.new_state());
        assert_eq!(machine.state(), &SerialApiMachineState::WaitingForResponse);

        let response: Message = SendDataResponse { was_sent: true }.into();
        let t = machine
            .next(SerialApiMachineInput::Response(response), eval)
            .unwrap();
        machine.transition(t.new_state());
        assert_eq!(machine.state(), &SerialApiMachineState::WaitingForCallback);

        let callback: Message = SendDataCallback {
            callback_id: Some(1),
            transmit_status: TransmitStatus::Ok,
            transmit_report: Default::default(),
        }
        .into();
        let t = machine
            .next(SerialApiMachineInput::Callback(callback.clone()), eval)
            .unwrap();
        machine.transition(t.new_state());
        assert!(machine.done());
        assert_eq!(
            machine.state(),
            &SerialApiMachineState::Done(SerialApiMachineResult::Success(Some(callback)))
        );
    }

    #[test]
    fn test_ack_only_command() {
        let mut machine = SerialApiMachine::new();
        let eval = |_: SerialApiMachineCondition| false;

        let t = machine.next(SerialApiMachineInput::Start, eval).unwrap();
        machine.transition(t.new_state());
        let t = machine.next(SerialApiMachineInput::ACK, eval).unwrap();
        machine.transition(t.new_state());
        assert_eq!(
            machine.state(),
            &SerialApiMachineState::Done(SerialApiMachineResult::Success(None))
        );
    }

    #[test]
    fn test_timeout_in_waiting_for_ack() {
        let mut machine = SerialApiMachine::new();
        let eval = |_: SerialApiMachineCondition| true;

        let t = machine.next(SerialApiMachineInput::Start, eval).unwrap();
        machine.transition(t.new_state());
        let t = machine.next(SerialApiMachineInput::Timeout, eval).unwrap();
        machine.transition(t.new_state());
        assert_eq!(
            machine.state(),
            &SerialApiMachineState::Done(SerialApiMachineResult::ACKTimeout)
        );
    }

    #[test]
    fn test_unexpected_input_is_ignored() {
        let machine = SerialApiMachine::new();
        let eval = |_: SerialApiMachineCondition| true;
        // A stray ACK before starting does not transition
        assert!(machine.next(SerialApiMachineInput::ACK, eval).is_none());
    }
}
