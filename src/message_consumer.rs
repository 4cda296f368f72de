#[cfg(test)] use mockall::automock;


/// Receives encoded frames. Proxy engines hand the frames they produce to a consumer, and they
///  are consumers themselves, so engines can be chained.
///
/// `buffer` holds exactly one frame and is only valid for the duration of the call.
#[cfg_attr(test, automock)]
pub trait MessageConsumer {
    fn on_message(&mut self, type_id: u32, buffer: &[u8]);
}

impl<T: MessageConsumer + ?Sized> MessageConsumer for Box<T> {
    fn on_message(&mut self, type_id: u32, buffer: &[u8]) {
        (**self).on_message(type_id, buffer)
    }
}
