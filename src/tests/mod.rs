mod support;

mod test_memory_store;
mod test_transport;
