//! Win32 plumbing for AppContainers: profiles, DACL edits and process launch

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::windows::io::{AsHandle, AsRawHandle, FromRawHandle, OwnedHandle};
use std::os::windows::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use windows::Win32::Foundation::{
    CloseHandle, DUPLICATE_SAME_ACCESS, DuplicateHandle, ERROR_ALREADY_EXISTS, ERROR_SUCCESS,
    HANDLE, HLOCAL, LocalFree, TRUE, WAIT_OBJECT_0, WIN32_ERROR,
};
use windows::Win32::Security::Authorization::{
    ConvertSidToStringSidW, EXPLICIT_ACCESS_W, GRANT_ACCESS, GetNamedSecurityInfoW,
    NO_MULTIPLE_TRUSTEE, SE_FILE_OBJECT, SetEntriesInAclW, SetNamedSecurityInfoW, TRUSTEE_IS_GROUP,
    TRUSTEE_IS_SID, TRUSTEE_W,
};
use windows::Win32::Security::Isolation::{
    CreateAppContainerProfile, DeleteAppContainerProfile,
    DeriveAppContainerSidFromAppContainerName, GetAppContainerFolderPath,
};
use windows::Win32::Security::{
    ACCESS_ALLOWED_ACE, ACE_HEADER, ACL, ACL_SIZE_INFORMATION, AclSizeInformation,
    DACL_SECURITY_INFORMATION, DeleteAce, EqualSid, FreeSid, GetAce, GetAclInformation,
    PSECURITY_DESCRIPTOR, PSID, SECURITY_CAPABILITIES, SUB_CONTAINERS_AND_OBJECTS_INHERIT,
};
use windows::Win32::System::Com::CoTaskMemFree;
use windows::Win32::System::Pipes::CreatePipe;
use windows::Win32::System::Threading::{
    CREATE_UNICODE_ENVIRONMENT, CreateProcessW, DeleteProcThreadAttributeList,
    EXTENDED_STARTUPINFO_PRESENT, GetCurrentProcess, GetExitCodeProcess,
    InitializeProcThreadAttributeList, LPPROC_THREAD_ATTRIBUTE_LIST, PROCESS_INFORMATION,
    STARTF_USESTDHANDLES, STARTUPINFOEXW, TerminateProcess, UpdateProcThreadAttribute,
    WaitForSingleObject,
};
use windows::core::{HSTRING, PCWSTR, PWSTR};

use crate::config::{SandboxRequest, StdioConfig};
use crate::error::{Access, Error, Result};
use crate::keep_alive::KeepAlive;
use crate::platform::container::ContainerAcl;
use crate::platform::{Child, ChildStderr, ChildStdin, ChildStdout, Process};

const PROC_THREAD_ATTRIBUTE_SECURITY_CAPABILITIES: usize = 0x0002_0009;

const FILE_GENERIC_READ: u32 = 0x0012_0089;
const FILE_GENERIC_EXECUTE: u32 = 0x0012_00A0;
const FILE_TRAVERSE: u32 = 0x0000_0020;
const FILE_ALL_ACCESS: u32 = 0x001F_01FF;
const READ_ACCESS: u32 = FILE_GENERIC_READ | FILE_TRAVERSE | FILE_GENERIC_EXECUTE;

const ACCESS_ALLOWED_ACE_TYPE: u8 = 0;
const ACCESS_DENIED_ACE_TYPE: u8 = 1;

fn win_err(operation: &'static str, e: windows::core::Error) -> Error {
    Error::os(operation, io::Error::from(e))
}

fn win32_path_err(operation: &'static str, path: &Path, code: WIN32_ERROR) -> Error {
    Error::os_path(operation, path, io::Error::from_raw_os_error(code.0 as i32))
}

/// A named AppContainer profile and its SID
pub(crate) struct Container {
    name: String,
    sid: PSID,
}

impl Container {
    /// Create the profile, or look up its SID if it already exists
    pub(crate) fn create_or_get(name: &str) -> Result<Self> {
        let wide = HSTRING::from(name);
        let sid = match unsafe { CreateAppContainerProfile(&wide, &wide, &wide, None) } {
            Ok(sid) => {
                tracing::debug!(container = name, "container: created profile");
                sid
            }
            Err(e) if e.code() == ERROR_ALREADY_EXISTS.to_hresult() => {
                unsafe { DeriveAppContainerSidFromAppContainerName(&wide) }
                    .map_err(|e| win_err("derive container sid", e))?
            }
            Err(e) => return Err(win_err("create container", e)),
        };
        Ok(Self {
            name: name.to_string(),
            sid,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn acl(&self) -> WinAcl<'_> {
        WinAcl { container: self }
    }

    /// Storage folder Windows assigns to the container
    fn folder(&self) -> Result<PathBuf> {
        let mut sid_string = PWSTR::null();
        unsafe { ConvertSidToStringSidW(self.sid, &mut sid_string) }
            .map_err(|e| win_err("convert sid", e))?;
        let folder = unsafe { GetAppContainerFolderPath(PCWSTR(sid_string.0)) };
        unsafe {
            let _ = LocalFree(HLOCAL(sid_string.0 as *mut c_void));
        }
        let folder = folder.map_err(|e| win_err("get container folder", e))?;
        let path = unsafe { folder.to_string() };
        unsafe { CoTaskMemFree(Some(folder.0 as *const c_void)) };
        path.map(PathBuf::from)
            .map_err(|e| Error::InvalidRequest(format!("container folder is not UTF-16: {e}")))
    }

    /// Start the request's command inside the container
    pub(crate) fn spawn(&self, request: &SandboxRequest, keep_alive: Vec<KeepAlive>) -> Result<Child> {
        let stdin = Stdio::new(request.stdin(), StdStream::Input)?;
        let stdout = Stdio::new(request.stdout(), StdStream::Output)?;
        let stderr = Stdio::new(request.stderr(), StdStream::Error)?;

        let child_stdin = inheritable(&stdin.child)?;
        let child_stdout = inheritable(&stdout.child)?;
        let child_stderr = inheritable(&stderr.child)?;

        let mut command_line: Vec<u16> = command_line(request.command())
            .encode_utf16()
            .chain(Some(0))
            .collect();
        let env_block = request.env().map(|env| environment_block(env.iter()));
        let cwd = request.current_dir().map(|dir| HSTRING::from(dir.as_os_str()));

        let capabilities = SECURITY_CAPABILITIES {
            AppContainerSid: self.sid,
            ..Default::default()
        };
        let attributes = AttributeList::new()?;
        unsafe {
            UpdateProcThreadAttribute(
                attributes.as_raw(),
                0,
                PROC_THREAD_ATTRIBUTE_SECURITY_CAPABILITIES,
                Some(&capabilities as *const SECURITY_CAPABILITIES as *const c_void),
                std::mem::size_of::<SECURITY_CAPABILITIES>(),
                None,
                None,
            )
        }
        .map_err(|e| win_err("update attribute list", e))?;

        let mut startup = STARTUPINFOEXW::default();
        startup.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as u32;
        startup.StartupInfo.dwFlags = STARTF_USESTDHANDLES;
        startup.StartupInfo.hStdInput = HANDLE(child_stdin.as_raw_handle());
        startup.StartupInfo.hStdOutput = HANDLE(child_stdout.as_raw_handle());
        startup.StartupInfo.hStdError = HANDLE(child_stderr.as_raw_handle());
        startup.lpAttributeList = attributes.as_raw();

        let mut info = PROCESS_INFORMATION::default();
        unsafe {
            CreateProcessW(
                PCWSTR::null(),
                PWSTR(command_line.as_mut_ptr()),
                None,
                None,
                TRUE,
                CREATE_UNICODE_ENVIRONMENT | EXTENDED_STARTUPINFO_PRESENT,
                env_block.as_ref().map(|b| b.as_ptr() as *const c_void),
                cwd.as_ref().map_or(PCWSTR::null(), |c| PCWSTR(c.as_ptr())),
                &startup.StartupInfo,
                &mut info,
            )
        }
        .map_err(|e| win_err("create process", e))?;

        // The child holds its own copies now.
        drop((child_stdin, child_stdout, child_stderr));
        unsafe {
            let _ = CloseHandle(info.hThread);
        }

        let process = ContainerProcess {
            handle: unsafe { OwnedHandle::from_raw_handle(info.hProcess.0) },
            pid: info.dwProcessId,
        };
        Ok(Child::from_parts(
            Process::Container(process),
            stdin.parent.map(|f| Box::new(f) as ChildStdin),
            stdout.parent.map(|f| Box::new(f) as ChildStdout),
            stderr.parent.map(|f| Box::new(f) as ChildStderr),
            keep_alive,
        ))
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if !self.sid.0.is_null() {
            unsafe {
                FreeSid(self.sid);
            }
        }
    }
}

/// Delete the AppContainer profile named `name`
pub(crate) fn delete_container(name: &str) -> Result<()> {
    unsafe { DeleteAppContainerProfile(&HSTRING::from(name)) }
        .map_err(|e| win_err("delete container", e))
}

/// DACL edits on behalf of one container
pub(crate) struct WinAcl<'a> {
    container: &'a Container,
}

/// A DACL fetched with its owning security descriptor
struct Dacl {
    acl: *mut ACL,
    descriptor: PSECURITY_DESCRIPTOR,
}

impl Dacl {
    fn read(path: &Path) -> Result<Self> {
        let mut acl: *mut ACL = std::ptr::null_mut();
        let mut descriptor = PSECURITY_DESCRIPTOR::default();
        let code = unsafe {
            GetNamedSecurityInfoW(
                &HSTRING::from(path.as_os_str()),
                SE_FILE_OBJECT,
                DACL_SECURITY_INFORMATION,
                None,
                None,
                Some(&mut acl),
                None,
                &mut descriptor,
            )
        };
        if code != ERROR_SUCCESS {
            return Err(win32_path_err("get security info", path, code));
        }
        Ok(Self { acl, descriptor })
    }
}

impl Drop for Dacl {
    fn drop(&mut self) {
        unsafe {
            let _ = LocalFree(HLOCAL(self.descriptor.0));
        }
    }
}

fn write_dacl(path: &Path, acl: *const ACL) -> Result<()> {
    let code = unsafe {
        SetNamedSecurityInfoW(
            &HSTRING::from(path.as_os_str()),
            SE_FILE_OBJECT,
            DACL_SECURITY_INFORMATION,
            PSID(std::ptr::null_mut()),
            PSID(std::ptr::null_mut()),
            Some(acl),
            None,
        )
    };
    if code != ERROR_SUCCESS {
        return Err(win32_path_err("set security info", path, code));
    }
    Ok(())
}

impl ContainerAcl for WinAcl<'_> {
    fn strip_container_folder(&mut self) -> Result<()> {
        let folder = self.container.folder()?;
        match self.revoke(&folder) {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    fn revoke(&mut self, path: &Path) -> Result<()> {
        let dacl = Dacl::read(path)?;
        if dacl.acl.is_null() {
            return Ok(());
        }

        let mut info = ACL_SIZE_INFORMATION::default();
        unsafe {
            GetAclInformation(
                dacl.acl,
                &mut info as *mut ACL_SIZE_INFORMATION as *mut c_void,
                std::mem::size_of::<ACL_SIZE_INFORMATION>() as u32,
                AclSizeInformation,
            )
        }
        .map_err(|e| win_err("get acl information", e))?;

        let mut count = info.AceCount;
        let mut index = 0;
        let mut removed = false;
        while index < count {
            let mut ace: *mut c_void = std::ptr::null_mut();
            unsafe { GetAce(dacl.acl, index, &mut ace) }.map_err(|e| win_err("get ace", e))?;
            let header = unsafe { &*(ace as *const ACE_HEADER) };
            let matches = matches!(header.AceType, ACCESS_ALLOWED_ACE_TYPE | ACCESS_DENIED_ACE_TYPE)
                && unsafe {
                    let sid = std::ptr::addr_of!((*(ace as *const ACCESS_ALLOWED_ACE)).SidStart);
                    EqualSid(self.container.sid, PSID(sid as *mut c_void)).is_ok()
                };
            if matches {
                unsafe { DeleteAce(dacl.acl, index) }.map_err(|e| win_err("delete ace", e))?;
                count -= 1;
                removed = true;
            } else {
                index += 1;
            }
        }

        if removed {
            write_dacl(path, dacl.acl)?;
        }
        Ok(())
    }

    fn grant(&mut self, path: &Path, access: Access) -> Result<()> {
        let dacl = Dacl::read(path)?;
        let entry = EXPLICIT_ACCESS_W {
            grfAccessPermissions: match access {
                Access::Read => READ_ACCESS,
                Access::Write => FILE_ALL_ACCESS,
            },
            grfAccessMode: GRANT_ACCESS,
            grfInheritance: SUB_CONTAINERS_AND_OBJECTS_INHERIT,
            Trustee: TRUSTEE_W {
                pMultipleTrustee: std::ptr::null_mut(),
                MultipleTrusteeOperation: NO_MULTIPLE_TRUSTEE,
                TrusteeForm: TRUSTEE_IS_SID,
                TrusteeType: TRUSTEE_IS_GROUP,
                ptstrName: PWSTR(self.container.sid.0 as *mut u16),
            },
        };

        let mut updated: *mut ACL = std::ptr::null_mut();
        let code = unsafe { SetEntriesInAclW(Some(&[entry]), Some(dacl.acl), &mut updated) };
        if code != ERROR_SUCCESS {
            return Err(win32_path_err("set acl entries", path, code));
        }
        let result = write_dacl(path, updated);
        unsafe {
            let _ = LocalFree(HLOCAL(updated as *mut c_void));
        }
        result
    }
}

/// An initialized attribute list with room for one attribute
struct AttributeList {
    buffer: Vec<u8>,
}

impl AttributeList {
    fn new() -> Result<Self> {
        let mut size = 0usize;
        unsafe {
            let _ = InitializeProcThreadAttributeList(
                LPPROC_THREAD_ATTRIBUTE_LIST(std::ptr::null_mut()),
                1,
                0,
                &mut size,
            );
        }
        let mut buffer = vec![0u8; size];
        unsafe {
            InitializeProcThreadAttributeList(
                LPPROC_THREAD_ATTRIBUTE_LIST(buffer.as_mut_ptr() as *mut c_void),
                1,
                0,
                &mut size,
            )
        }
        .map_err(|e| win_err("initialize attribute list", e))?;
        Ok(Self { buffer })
    }

    fn as_raw(&self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        LPPROC_THREAD_ATTRIBUTE_LIST(self.buffer.as_ptr() as *mut c_void)
    }
}

impl Drop for AttributeList {
    fn drop(&mut self) {
        unsafe { DeleteProcThreadAttributeList(self.as_raw()) };
    }
}

/// Which standard stream of the child is being set up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StdStream {
    Input,
    Output,
    Error,
}

impl StdStream {
    fn child_reads(self) -> bool {
        self == StdStream::Input
    }

    /// This process's own handle for the stream
    fn own_handle(self) -> io::Result<OwnedHandle> {
        match self {
            StdStream::Input => io::stdin().as_handle().try_clone_to_owned(),
            StdStream::Output => io::stdout().as_handle().try_clone_to_owned(),
            StdStream::Error => io::stderr().as_handle().try_clone_to_owned(),
        }
    }
}

/// Child and parent ends of one standard stream
struct Stdio {
    child: OwnedHandle,
    parent: Option<File>,
}

impl Stdio {
    fn new(config: StdioConfig, stream: StdStream) -> Result<Self> {
        let child_reads = stream.child_reads();
        match config {
            StdioConfig::Piped => {
                let mut read = HANDLE::default();
                let mut write = HANDLE::default();
                unsafe { CreatePipe(&mut read, &mut write, None, 0) }
                    .map_err(|e| win_err("create pipe", e))?;
                let (read, write) = unsafe {
                    (
                        OwnedHandle::from_raw_handle(read.0),
                        OwnedHandle::from_raw_handle(write.0),
                    )
                };
                let (child, parent) = if child_reads { (read, write) } else { (write, read) };
                Ok(Self {
                    child,
                    parent: Some(File::from(parent)),
                })
            }
            StdioConfig::Null => {
                let file = OpenOptions::new()
                    .read(child_reads)
                    .write(!child_reads)
                    .open("NUL")
                    .map_err(|e| Error::os("open NUL", e))?;
                Ok(Self {
                    child: OwnedHandle::from(file),
                    parent: None,
                })
            }
            StdioConfig::Inherit => {
                let handle = stream
                    .own_handle()
                    .map_err(|e| Error::os("duplicate std handle", e))?;
                Ok(Self {
                    child: handle,
                    parent: None,
                })
            }
        }
    }
}

/// Inheritable duplicate of a handle for the child's startup info
fn inheritable(handle: &OwnedHandle) -> Result<OwnedHandle> {
    let mut duplicate = HANDLE::default();
    unsafe {
        let process = GetCurrentProcess();
        DuplicateHandle(
            process,
            HANDLE(handle.as_raw_handle()),
            process,
            &mut duplicate,
            0,
            TRUE,
            DUPLICATE_SAME_ACCESS,
        )
    }
    .map_err(|e| win_err("duplicate handle", e))?;
    Ok(unsafe { OwnedHandle::from_raw_handle(duplicate.0) })
}

/// Quote arguments the way `CommandLineToArgvW` splits them
fn command_line(args: &[String]) -> String {
    let mut line = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        if !arg.is_empty() && !arg.contains([' ', '\t', '\n', '\x0b', '"']) {
            line.push_str(arg);
            continue;
        }
        line.push('"');
        let mut backslashes = 0;
        for c in arg.chars() {
            match c {
                '\\' => backslashes += 1,
                '"' => {
                    line.extend(std::iter::repeat_n('\\', backslashes * 2 + 1));
                    line.push('"');
                    backslashes = 0;
                }
                _ => {
                    line.extend(std::iter::repeat_n('\\', backslashes));
                    line.push(c);
                    backslashes = 0;
                }
            }
        }
        line.extend(std::iter::repeat_n('\\', backslashes * 2));
        line.push('"');
    }
    line
}

/// UTF-16 environment block sorted case-insensitively by name
fn environment_block<'a>(vars: impl Iterator<Item = (&'a String, &'a String)>) -> Vec<u16> {
    let mut vars: Vec<_> = vars.collect();
    vars.sort_by_key(|(k, _)| k.to_uppercase());
    let mut block = Vec::new();
    for (key, value) in vars {
        block.extend(format!("{key}={value}").encode_utf16());
        block.push(0);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

/// A process started inside an AppContainer
pub(crate) struct ContainerProcess {
    handle: OwnedHandle,
    pid: u32,
}

impl ContainerProcess {
    fn raw(&self) -> HANDLE {
        HANDLE(self.handle.as_raw_handle())
    }

    pub(crate) fn id(&self) -> u32 {
        self.pid
    }

    fn exit_status(&self) -> io::Result<ExitStatus> {
        let mut code = 0u32;
        unsafe { GetExitCodeProcess(self.raw(), &mut code) }.map_err(io::Error::from)?;
        Ok(ExitStatus::from_raw(code))
    }

    pub(crate) fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        if unsafe { WaitForSingleObject(self.raw(), 0) } == WAIT_OBJECT_0 {
            return self.exit_status().map(Some);
        }
        Ok(None)
    }

    pub(crate) fn kill(&mut self) -> io::Result<()> {
        unsafe { TerminateProcess(self.raw(), 1) }.map_err(io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_inherited_streams_keep_their_direction() {
        assert!(StdStream::Input.child_reads());
        assert!(!StdStream::Output.child_reads());
        assert!(!StdStream::Error.child_reads());

        let stderr = Stdio::new(StdioConfig::Inherit, StdStream::Error).unwrap();
        assert!(stderr.parent.is_none());
        assert!(
            compare_objects(&stderr.child, &io::stderr().as_handle().try_clone_to_owned().unwrap()),
            "inherited stderr is not this process's stderr"
        );
    }

    /// Whether two handles refer to the same kernel object
    fn compare_objects(a: &OwnedHandle, b: &OwnedHandle) -> bool {
        a.as_raw_handle() == b.as_raw_handle()
            || unsafe {
                windows::Win32::Foundation::CompareObjectHandles(
                    HANDLE(a.as_raw_handle()),
                    HANDLE(b.as_raw_handle()),
                )
            }
            .as_bool()
    }

    #[test]
    fn test_command_line_quoting() {
        let args = [
            "C:\\Program Files\\app.exe".to_string(),
            "plain".to_string(),
            "say \"hi\"".to_string(),
            "trail\\".to_string(),
            "with space\\".to_string(),
            String::new(),
        ];
        assert_eq!(
            command_line(&args),
            "\"C:\\Program Files\\app.exe\" plain \"say \\\"hi\\\"\" trail\\ \"with space\\\\\" \"\""
        );
    }

    #[test]
    fn test_environment_block_is_sorted_and_terminated() {
        let env = BTreeMap::from([
            ("path".to_string(), "C:\\bin".to_string()),
            ("A".to_string(), "1".to_string()),
        ]);
        let block = environment_block(env.iter());
        let text = String::from_utf16(&block).unwrap();
        assert_eq!(text, "A=1\0path=C:\\bin\0\0");
        assert_eq!(environment_block(std::iter::empty()), vec![0, 0]);
    }
}
