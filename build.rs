fn main() {
  cfg_aliases::cfg_aliases! {
      linux: { target_os = "linux" },
      apple: { target_vendor = "apple" },
      bsd: { any(
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
      ) },
      kqueue: { any(
        target_vendor = "apple",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
      ) },
  }
}
