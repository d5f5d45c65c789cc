#[cfg(linux)]
pub(crate) mod epoll;

#[cfg(kqueue)]
pub(crate) mod kqueue;
