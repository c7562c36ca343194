pub(crate) mod stub_pool;
