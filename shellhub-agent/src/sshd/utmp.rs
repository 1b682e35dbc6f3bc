//! utmpx bookkeeping for interactive multi-user sessions.

#![cfg(target_os = "linux")]

/// Records a login in the utmpx database.
pub fn write_login(username: &str, line: &str, pid: i32) {
    let Some(entry) = build_entry(libc::USER_PROCESS, username, line, pid) else {
        return;
    };

    // SAFETY: pututxline copies the entry; the struct lives for the whole
    // call and the setutxent/endutxent bracket serializes access.
    unsafe {
        libc::setutxent();
        libc::pututxline(&entry);
        libc::endutxent();
    }
}

/// Marks the login dead once the session ends.
pub fn write_logout(line: &str, pid: i32) {
    let Some(entry) = build_entry(libc::DEAD_PROCESS, "", line, pid) else {
        return;
    };

    // SAFETY: same contract as in `write_login`.
    unsafe {
        libc::setutxent();
        libc::pututxline(&entry);
        libc::endutxent();
    }
}

fn build_entry(ut_type: libc::c_short, username: &str, line: &str, pid: i32) -> Option<libc::utmpx> {
    // SAFETY: utmpx is a plain-old-data struct; zeroed is a valid value.
    let mut entry: libc::utmpx = unsafe { std::mem::zeroed() };

    entry.ut_type = ut_type;
    entry.ut_pid = pid;

    copy_into(&mut entry.ut_user, username)?;
    copy_into(&mut entry.ut_line, line.strip_prefix("/dev/").unwrap_or(line))?;
    copy_into(&mut entry.ut_id, line.get(line.len().saturating_sub(4)..).unwrap_or(line))?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?;
    entry.ut_tv.tv_sec = i32::try_from(now.as_secs()).ok()?;
    entry.ut_tv.tv_usec = i32::try_from(now.subsec_micros()).ok()?;

    Some(entry)
}

fn copy_into(dst: &mut [libc::c_char], src: &str) -> Option<()> {
    let bytes = src.as_bytes();
    if bytes.len() >= dst.len() {
        return None;
    }

    for (slot, byte) in dst.iter_mut().zip(bytes) {
        *slot = *byte as libc::c_char;
    }

    Some(())
}
